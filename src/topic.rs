//! Topic matcher (spec §4.2).
//!
//! A topic is a fixed-arity tuple of parts describing which datoms a
//! mutation touched (an invalidation topic) or which datoms a cached
//! datalog query read (a coarse/refined datalog-query topic). This module
//! is pure and allocation-light; it is the inner loop of invalidation.

use std::collections::BTreeSet;

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

/// One position within a topic tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicPart {
    /// An exact scalar (a keyword, in the source vocabulary).
    Keyword(Value),
    /// A wildcard (a symbol, e.g. `?e`) — matches anything.
    Wildcard,
    /// A set of values; matches if the other side intersects it.
    Set(BTreeSet<Value>),
    /// `{$comparator: {op, value}}`.
    Comparator(CompareOp, Value),
    /// `{$not: value}`.
    Not(Value),
}

/// A topic: a fixed-arity tuple of parts.
pub type Topic = Vec<TopicPart>;

/// Matches a single `like` pattern against a string. `_` matches any single
/// character, `%` matches any run of characters (including none); the match
/// is anchored at both ends.
pub fn like_match(pattern: &str, value: &str) -> bool {
    fn recurse(pat: &[char], val: &[char]) -> bool {
        match pat.first() {
            None => val.is_empty(),
            Some('%') => recurse(&pat[1..], val) || (!val.is_empty() && recurse(pat, &val[1..])),
            Some('_') => !val.is_empty() && recurse(&pat[1..], &val[1..]),
            Some(c) => val.first() == Some(c) && recurse(&pat[1..], &val[1..]),
        }
    }
    let pat: Vec<char> = pattern.chars().collect();
    let val: Vec<char> = value.chars().collect();
    recurse(&pat, &val)
}

fn compare(op: CompareOp, v: &Value, threshold: &Value) -> bool {
    match op {
        CompareOp::Gt => v > threshold,
        CompareOp::Gte => v >= threshold,
        CompareOp::Lt => v < threshold,
        CompareOp::Lte => v <= threshold,
        CompareOp::Like => match (v, threshold) {
            (Value::Str(v), Value::Str(pattern)) => like_match(pattern, v),
            _ => false,
        },
    }
}

/// Matches one position of an invalidation topic (`iv`) against the
/// corresponding position of a cached datalog-query topic (`dq`), per the
/// table in spec §4.2.
fn match_topic_part(iv: &TopicPart, dq: &TopicPart) -> bool {
    match (iv, dq) {
        // keyword K | anything -> K == dq
        (TopicPart::Keyword(k), TopicPart::Keyword(v)) => k == v,
        (TopicPart::Keyword(k), TopicPart::Set(s)) => s.contains(k),
        (TopicPart::Keyword(k), TopicPart::Comparator(op, threshold)) => compare(*op, k, threshold),
        (TopicPart::Keyword(k), TopicPart::Not(x)) => k != x,

        // any | symbol -> true (wildcard), symbol | any -> true
        (_, TopicPart::Wildcard) => true,
        (TopicPart::Wildcard, _) => true,

        // set S | set T -> non-empty intersection
        (TopicPart::Set(s), TopicPart::Set(t)) => s.iter().any(|v| t.contains(v)),

        // set S | comparator -> exists v in S: cmp(v, value)
        (TopicPart::Set(s), TopicPart::Comparator(op, threshold)) => s.iter().any(|v| compare(*op, v, threshold)),

        // set S | $not x -> exists v in S: v != x
        (TopicPart::Set(s), TopicPart::Not(x)) => s.iter().any(|v| v != x),

        // set S against a bare keyword: symmetric with (Keyword, Set) above
        (TopicPart::Set(s), TopicPart::Keyword(k)) => s.contains(k),

        (iv, dq) => panic!(
            "match_topic_part: unrecognized topic-part shape (iv={iv:?}, dq={dq:?}); \
             an unknown map/part shape is a programming error, not a silent non-match"
        ),
    }
}

/// Matches an invalidation topic against a cached datalog-query topic of
/// equal arity. Both topics must have the same number of parts.
pub fn match_topic(iv: &Topic, dq: &Topic) -> bool {
    if iv.len() != dq.len() {
        return false;
    }
    iv.iter().zip(dq.iter()).all(|(a, b)| match_topic_part(a, b))
}

/// Topic **lists** intersect if any `iv` topic matches any `dq` topic.
/// Short-circuits on the first hit, per spec §4.2.
pub fn topics_intersect(iv_topics: &[Topic], dq_topics: &[Topic]) -> bool {
    iv_topics.iter().any(|iv| dq_topics.iter().any(|dq| match_topic(iv, dq)))
}
