// Function signature parsing and argument validation
//
// Signatures are the compact `<params:return>` strings attached to lambdas
// (and available to hosts registering natives). Each parameter is a
// single-character type code — b(ool) n(umber) s(tring) l(null) a(rray)
// o(bject) f(unction) j(any JSON) x(any) — or a parenthesized union, with
// optional suffixes: `?` optional, `+` variadic, `-` context fallback.
// Compilation builds one regex over type-code characters; validation
// renders the actual argument list to its code string and matches.

use std::fmt;

use regex::Regex;
use thiserror::Error;

use crate::value::JValue;

/// Signature validation errors. These surface through the evaluator with
/// their stable codes intact.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignatureError {
    #[error("S0401: invalid type signature: {reason}")]
    InvalidSignature { reason: String },

    #[error("T0410: argument {index} of function {name} does not match function signature")]
    ArgumentMismatch { name: String, index: usize },

    #[error("T0411: context value is not a compatible type with argument {index} of function {name}")]
    ContextTypeMismatch { name: String, index: usize },

    #[error("T0412: argument {index} of function {name} must be an array of {type_name}")]
    ArrayElementMismatch {
        name: String,
        index: usize,
        type_name: String,
    },
}

impl SignatureError {
    pub fn code(&self) -> &'static str {
        match self {
            SignatureError::InvalidSignature { .. } => "S0401",
            SignatureError::ArgumentMismatch { .. } => "T0410",
            SignatureError::ContextTypeMismatch { .. } => "T0411",
            SignatureError::ArrayElementMismatch { .. } => "T0412",
        }
    }
}

/// One parsed parameter of a signature.
#[derive(Debug, Clone, PartialEq)]
struct SigParam {
    /// Accepted type codes, expanded (e.g. `j` becomes `bnslao`).
    classes: String,
    /// Element subtype for `a<n>`-style array parameters.
    subtype: Option<char>,
    optional: bool,
    variadic: bool,
    /// `-` suffix: substitute the evaluation context when absent.
    context: bool,
}

/// A compiled function signature.
#[derive(Debug, Clone)]
pub struct Signature {
    source: String,
    params: Vec<SigParam>,
    matcher: Regex,
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn expand_code(code: char) -> Option<&'static str> {
    match code {
        'b' => Some("b"),
        'n' => Some("n"),
        's' => Some("s"),
        'l' => Some("l"),
        'a' => Some("a"),
        'o' => Some("o"),
        'f' => Some("f"),
        // any JSON value
        'j' => Some("bnslao"),
        // any value at all
        'x' => Some("bnslaof"),
        _ => None,
    }
}

fn type_name(code: char) -> &'static str {
    match code {
        'b' => "boolean",
        'n' => "number",
        's' => "string",
        'l' => "null",
        'a' => "array",
        'o' => "object",
        'f' => "function",
        _ => "value",
    }
}

/// The type code of an actual argument. `m` marks a missing (undefined)
/// argument and only matches optional parameters.
pub fn value_code(value: &JValue) -> char {
    match value {
        JValue::Undefined => 'm',
        JValue::Null => 'l',
        JValue::Bool(_) => 'b',
        JValue::Integer(_) | JValue::Float(_) => 'n',
        JValue::String(_) => 's',
        JValue::Array(..) => 'a',
        JValue::Object(_) => 'o',
        JValue::Function(_) => 'f',
    }
}

impl Signature {
    /// Parse and compile a signature. `source` is the full `<...>` string
    /// including the angle brackets.
    pub fn parse(source: &str) -> Result<Signature, SignatureError> {
        let invalid = |reason: &str| SignatureError::InvalidSignature {
            reason: reason.to_string(),
        };

        let inner = source
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .ok_or_else(|| invalid("signature must be enclosed in angle brackets"))?;

        // Everything after a top-level ':' is the (unchecked) return type.
        let mut depth = 0usize;
        let mut params_part = inner;
        for (i, c) in inner.char_indices() {
            match c {
                '<' | '(' => depth += 1,
                '>' | ')' => depth = depth.saturating_sub(1),
                ':' if depth == 0 => {
                    params_part = &inner[..i];
                    break;
                }
                _ => {}
            }
        }

        let mut params = Vec::new();
        let chars: Vec<char> = params_part.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            let classes = if c == '(' {
                // parenthesized union of simple codes
                let mut union = String::new();
                i += 1;
                while i < chars.len() && chars[i] != ')' {
                    let expanded = expand_code(chars[i])
                        .ok_or_else(|| invalid(&format!("unknown type code '{}'", chars[i])))?;
                    for e in expanded.chars() {
                        if !union.contains(e) {
                            union.push(e);
                        }
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(invalid("unterminated choice group"));
                }
                i += 1; // ')'
                union
            } else {
                let expanded =
                    expand_code(c).ok_or_else(|| invalid(&format!("unknown type code '{}'", c)))?;
                i += 1;
                expanded.to_string()
            };

            // array element subtype: a<n>
            let mut subtype = None;
            if i < chars.len() && chars[i] == '<' {
                if c != 'a' {
                    return Err(invalid("element subtype is only valid on array parameters"));
                }
                i += 1;
                if i >= chars.len() || expand_code(chars[i]).is_none() {
                    return Err(invalid("invalid array element subtype"));
                }
                subtype = Some(chars[i]);
                i += 1;
                if i >= chars.len() || chars[i] != '>' {
                    return Err(invalid("unterminated array element subtype"));
                }
                i += 1;
            }

            let mut param = SigParam {
                classes,
                subtype,
                optional: false,
                variadic: false,
                context: false,
            };
            while i < chars.len() {
                match chars[i] {
                    '?' => param.optional = true,
                    '+' => param.variadic = true,
                    '-' => param.context = true,
                    _ => break,
                }
                i += 1;
            }
            params.push(param);
        }

        let mut pattern = String::from("^");
        for param in &params {
            let class = if param.classes.len() == 1 {
                param.classes.clone()
            } else {
                format!("[{}]", param.classes)
            };
            if param.variadic {
                pattern.push_str(&format!("{}+", class));
            } else if param.optional || param.context {
                // absent entirely, or explicitly undefined
                pattern.push_str(&format!("(?:{}|m)?", class));
            } else {
                pattern.push_str(&class);
            }
        }
        pattern.push('$');

        let matcher = Regex::new(&pattern)
            .map_err(|e| invalid(&format!("cannot compile signature matcher: {}", e)))?;

        Ok(Signature {
            source: source.to_string(),
            params,
            matcher,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn render(args: &[JValue]) -> String {
        args.iter().map(value_code).collect()
    }

    /// Validate `args` against this signature, substituting the evaluation
    /// `context` for an absent `-`-marked parameter. Returns the (possibly
    /// augmented) argument list on success.
    pub fn validate(
        &self,
        name: &str,
        args: &[JValue],
        context: &JValue,
    ) -> Result<Vec<JValue>, SignatureError> {
        let supplied = Self::render(args);
        if self.matcher.is_match(&supplied) {
            self.check_subtypes(name, args)?;
            return Ok(args.to_vec());
        }

        // Retry with the context value substituted for the first
        // context-eligible parameter.
        if args.len() < self.params.len() {
            if let Some(pos) = self.params.iter().position(|p| p.context) {
                if pos <= args.len() {
                    let mut augmented = args.to_vec();
                    augmented.insert(pos, context.clone());
                    let resupplied = Self::render(&augmented);
                    if self.matcher.is_match(&resupplied) {
                        self.check_subtypes(name, &augmented)?;
                        return Ok(augmented);
                    }
                    // the context itself is the wrong type for that slot
                    if !self.params[pos].classes.contains(value_code(context)) {
                        return Err(SignatureError::ContextTypeMismatch {
                            name: name.to_string(),
                            index: pos + 1,
                        });
                    }
                }
            }
        }

        Err(SignatureError::ArgumentMismatch {
            name: name.to_string(),
            index: self.first_mismatch(args),
        })
    }

    /// 1-based index of the first argument that fails its parameter class,
    /// for error reporting.
    fn first_mismatch(&self, args: &[JValue]) -> usize {
        for (i, arg) in args.iter().enumerate() {
            match self.params.get(i.min(self.params.len().saturating_sub(1))) {
                Some(param) => {
                    let code = value_code(arg);
                    if code == 'm' && (param.optional || param.context) {
                        continue;
                    }
                    if !param.classes.contains(code) {
                        return i + 1;
                    }
                }
                None => return i + 1,
            }
        }
        args.len().max(1)
    }

    /// Per-element homogeneity for array parameters declaring a subtype.
    fn check_subtypes(&self, name: &str, args: &[JValue]) -> Result<(), SignatureError> {
        for (i, arg) in args.iter().enumerate() {
            // variadic tails reuse the last parameter spec
            let param = match self.params.get(i) {
                Some(p) => p,
                None => match self.params.last() {
                    Some(p) if p.variadic => p,
                    _ => break,
                },
            };
            if let (Some(subtype), JValue::Array(items, _)) = (param.subtype, arg) {
                let expanded = expand_code(subtype).unwrap_or("");
                for item in items.iter() {
                    if !expanded.contains(value_code(item)) {
                        return Err(SignatureError::ArrayElementMismatch {
                            name: name.to_string(),
                            index: i + 1,
                            type_name: type_name(subtype).to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let sig = Signature::parse("<s-nn?:s>").unwrap();
        assert_eq!(sig.params.len(), 3);
        assert!(sig.params[0].context);
        assert!(sig.params[2].optional);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Signature::parse("<q>").is_err());
        assert!(Signature::parse("sn").is_err());
        assert!(Signature::parse("<(sn>").is_err());
    }

    #[test]
    fn test_validate_accepts_matching_args() {
        let sig = Signature::parse("<sn>").unwrap();
        let args = vec![JValue::from("x"), JValue::Integer(1)];
        assert!(sig.validate("test", &args, &JValue::Undefined).is_ok());
    }

    #[test]
    fn test_validate_rejects_wrong_type() {
        let sig = Signature::parse("<sn>").unwrap();
        let args = vec![JValue::Integer(1), JValue::Integer(2)];
        let err = sig.validate("test", &args, &JValue::Undefined).unwrap_err();
        assert_eq!(err.code(), "T0410");
        assert!(matches!(
            err,
            SignatureError::ArgumentMismatch { index: 1, .. }
        ));
    }

    #[test]
    fn test_optional_params() {
        let sig = Signature::parse("<sn?>").unwrap();
        assert!(sig
            .validate("test", &[JValue::from("x")], &JValue::Undefined)
            .is_ok());
        assert!(sig
            .validate(
                "test",
                &[JValue::from("x"), JValue::Integer(3)],
                &JValue::Undefined
            )
            .is_ok());
    }

    #[test]
    fn test_context_substitution() {
        let sig = Signature::parse("<s-n>").unwrap();
        let result = sig
            .validate("test", &[JValue::Integer(2)], &JValue::from("ctx"))
            .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], JValue::from("ctx"));
    }

    #[test]
    fn test_context_type_mismatch() {
        let sig = Signature::parse("<s-n>").unwrap();
        let err = sig
            .validate("test", &[JValue::Integer(2)], &JValue::Bool(true))
            .unwrap_err();
        assert_eq!(err.code(), "T0411");
    }

    #[test]
    fn test_union_types() {
        let sig = Signature::parse("<(sn)>").unwrap();
        assert!(sig
            .validate("test", &[JValue::from("x")], &JValue::Undefined)
            .is_ok());
        assert!(sig
            .validate("test", &[JValue::Integer(1)], &JValue::Undefined)
            .is_ok());
        assert!(sig
            .validate("test", &[JValue::Bool(true)], &JValue::Undefined)
            .is_err());
    }

    #[test]
    fn test_array_subtype_homogeneity() {
        let sig = Signature::parse("<a<n>>").unwrap();
        let good = JValue::array(vec![1i64.into(), 2i64.into()]);
        assert!(sig
            .validate("test", &[good], &JValue::Undefined)
            .is_ok());

        let bad = JValue::array(vec![1i64.into(), "x".into()]);
        let err = sig.validate("test", &[bad], &JValue::Undefined).unwrap_err();
        assert_eq!(err.code(), "T0412");
    }

    #[test]
    fn test_variadic() {
        let sig = Signature::parse("<n+>").unwrap();
        assert!(sig
            .validate(
                "test",
                &[1i64.into(), 2i64.into(), 3i64.into()],
                &JValue::Undefined
            )
            .is_ok());
        assert!(sig.validate("test", &[], &JValue::Undefined).is_err());
    }

    #[test]
    fn test_j_matches_any_json() {
        let sig = Signature::parse("<j>").unwrap();
        for v in [
            JValue::Null,
            JValue::Bool(true),
            JValue::Integer(1),
            JValue::from("s"),
            JValue::array(vec![]),
        ] {
            assert!(sig.validate("test", &[v], &JValue::Undefined).is_ok());
        }
    }
}
