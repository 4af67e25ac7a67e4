// Sequence utilities shared by the evaluator and the builtin functions.

use crate::value::JValue;

/// Append a value to an accumulator with JSONata's append semantics:
/// arrays concatenate (one level), scalars push, Undefined is a no-op.
pub fn append_into(acc: &mut Vec<JValue>, value: JValue) {
    match value {
        JValue::Undefined => {}
        JValue::Array(items, _) => acc.extend(items.iter().cloned()),
        other => acc.push(other),
    }
}

/// `$append`-style combination of two values: Undefined on either side
/// yields the other side unchanged; otherwise both are treated as arrays
/// and concatenated into a sequence.
pub fn append(a: JValue, b: JValue) -> JValue {
    if a.is_undefined() {
        return b;
    }
    if b.is_undefined() {
        return a;
    }
    let mut out = Vec::new();
    append_into(&mut out, a);
    append_into(&mut out, b);
    JValue::sequence(out)
}

/// Deep-flatten an array value into `out` (scalars pass straight through).
pub fn flatten_deep_into(value: &JValue, out: &mut Vec<JValue>) {
    match value {
        JValue::Array(items, _) => {
            for item in items.iter() {
                flatten_deep_into(item, out);
            }
        }
        other => out.push(other.clone()),
    }
}

/// Stable merge sort with a fallible comparator. `comparator(a, b)` returns
/// true when `a` must be placed after `b`; errors abort the sort. Used for
/// the `^(...)` order-by clause and `$sort`, where key evaluation itself
/// can fail.
pub fn merge_sort<T, E>(
    items: Vec<T>,
    comparator: &mut impl FnMut(&T, &T) -> Result<bool, E>,
) -> Result<Vec<T>, E> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let mid = items.len() / 2;
    let mut right = items;
    let left = right.drain(..mid).collect::<Vec<_>>();
    let left = merge_sort(left, comparator)?;
    let right = merge_sort(right, comparator)?;

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut l = left.into_iter().peekable();
    let mut r = right.into_iter().peekable();
    loop {
        match (l.peek(), r.peek()) {
            (Some(a), Some(b)) => {
                // stability: take from the left unless it must come after
                if comparator(a, b)? {
                    merged.push(r.next().unwrap());
                } else {
                    merged.push(l.next().unwrap());
                }
            }
            (Some(_), None) => merged.push(l.next().unwrap()),
            (None, Some(_)) => merged.push(r.next().unwrap()),
            (None, None) => break,
        }
    }
    Ok(merged)
}
