//! Matcher evaluation: predicates over (key, attributes, storage view).
use std::cmp::Ordering;
use std::collections::HashSet;

use semver::Version;

use super::models::{DataType, Matcher, MatcherKind};
use crate::{AttributeValue, Attributes, Key};

/// Maximum recursion depth for dependency (in-split-treatment) matchers.
/// Beyond this, the matcher fails instead of looping on flag cycles.
pub const MAX_DEPENDENCY_DEPTH: u8 = 50;

/// Read-only view matchers use to reach beyond their own literals: segment
/// membership and dependent flag evaluation. Implemented by the evaluator.
pub trait MatcherScope {
    fn segment_contains(&self, segment: &str, key: &str) -> bool;

    fn large_segment_contains(&self, segment: &str, key: &str) -> bool;

    /// Evaluate the referenced flag for the same key/attributes. Returns
    /// `None` when the recursion limit is exceeded.
    fn dependency_treatment(
        &self,
        split: &str,
        key: &Key,
        attributes: Option<&Attributes>,
        depth: u8,
    ) -> Option<String>;
}

/// Everything a matcher needs to evaluate itself.
pub struct EvalContext<'a> {
    pub key: &'a Key,
    pub attributes: Option<&'a Attributes>,
    pub scope: &'a dyn MatcherScope,
    pub depth: u8,
}

/// The value a matcher operates on: either a user attribute or the matching
/// key itself (when no attribute name is declared).
enum MatchInput<'a> {
    Value(&'a AttributeValue),
    Key(&'a str),
}

impl<'a> MatchInput<'a> {
    fn as_str(&self) -> Option<&str> {
        match self {
            MatchInput::Value(value) => value.as_str(),
            MatchInput::Key(key) => Some(key),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            MatchInput::Value(value) => value.as_number(),
            MatchInput::Key(key) => key.parse().ok(),
        }
    }

    fn as_boolean(&self) -> Option<bool> {
        match self {
            MatchInput::Value(value) => value.as_boolean(),
            MatchInput::Key(key) => match key.to_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
        }
    }

    fn as_string_set(&self) -> Option<Vec<&str>> {
        match self {
            MatchInput::Value(value) => value.as_string_set(),
            MatchInput::Key(key) => Some(vec![key]),
        }
    }
}

impl Matcher {
    /// Evaluate the matcher, applying negation after the underlying check.
    pub fn evaluate(&self, ctx: &EvalContext) -> bool {
        self.negate ^ self.kind.evaluate(self.input(ctx), ctx)
    }

    fn input<'a>(&'a self, ctx: &EvalContext<'a>) -> Option<MatchInput<'a>> {
        match &self.attribute {
            Some(attribute) => match ctx.attributes.and_then(|attrs| attrs.get(attribute)) {
                Some(AttributeValue::Null) | None => None,
                Some(value) => Some(MatchInput::Value(value)),
            },
            None => Some(MatchInput::Key(ctx.key.matching_key())),
        }
    }
}

impl MatcherKind {
    fn evaluate(&self, input: Option<MatchInput>, ctx: &EvalContext) -> bool {
        self.try_evaluate(input, ctx).unwrap_or(false)
    }

    /// Apply the matcher, returning `None` when it cannot be applied (missing
    /// attribute, wrong type, unparseable literal).
    fn try_evaluate(&self, input: Option<MatchInput>, ctx: &EvalContext) -> Option<bool> {
        match self {
            MatcherKind::AllKeys => Some(true),

            MatcherKind::InSegment(name) => {
                Some(ctx.scope.segment_contains(name, ctx.key.matching_key()))
            }
            MatcherKind::InLargeSegment(name) => {
                Some(ctx.scope.large_segment_contains(name, ctx.key.matching_key()))
            }

            MatcherKind::Whitelist(whitelist) => {
                Some(whitelist.contains(input?.as_str()?))
            }

            MatcherKind::EqualTo { data_type, value } => {
                Some(compare_numeric(&input?, *data_type, |input| {
                    input == *value as f64
                })?)
            }
            MatcherKind::GreaterThanOrEqualTo { data_type, value } => {
                Some(compare_numeric(&input?, *data_type, |input| {
                    input >= *value as f64
                })?)
            }
            MatcherKind::LessThanOrEqualTo { data_type, value } => {
                Some(compare_numeric(&input?, *data_type, |input| {
                    input <= *value as f64
                })?)
            }
            MatcherKind::Between { data_type, start, end } => {
                Some(compare_numeric(&input?, *data_type, |input| {
                    *start as f64 <= input && input <= *end as f64
                })?)
            }

            MatcherKind::EqualToSet(expected) => {
                let input = to_owned_set(&input?)?;
                Some(input == *expected)
            }
            MatcherKind::PartOfSet(container) => {
                let input = to_owned_set(&input?)?;
                Some(!input.is_empty() && input.is_subset(container))
            }
            MatcherKind::ContainsAllOfSet(required) => {
                let input = to_owned_set(&input?)?;
                Some(input.is_superset(required))
            }
            MatcherKind::ContainsAnyOfSet(candidates) => {
                let input = to_owned_set(&input?)?;
                Some(input.intersection(candidates).next().is_some())
            }

            MatcherKind::StartsWith(prefixes) => {
                let input = input?;
                let s = input.as_str()?;
                Some(prefixes.iter().any(|prefix| s.starts_with(prefix)))
            }
            MatcherKind::EndsWith(suffixes) => {
                let input = input?;
                let s = input.as_str()?;
                Some(suffixes.iter().any(|suffix| s.ends_with(suffix)))
            }
            MatcherKind::ContainsString(fragments) => {
                let input = input?;
                let s = input.as_str()?;
                Some(fragments.iter().any(|fragment| s.contains(fragment)))
            }
            MatcherKind::MatchesString(regex) => {
                let input = input?;
                let s = input.as_str()?;
                Some(regex.as_ref()?.is_match(s))
            }

            MatcherKind::EqualToBoolean(expected) => Some(input?.as_boolean()? == *expected),

            MatcherKind::InSplitTreatment { split, treatments } => {
                let treatment = ctx.scope.dependency_treatment(
                    split,
                    ctx.key,
                    ctx.attributes,
                    ctx.depth,
                )?;
                Some(treatments.iter().any(|t| *t == treatment))
            }

            MatcherKind::EqualToSemver(expected) => {
                let version = parse_input_semver(&input?)?;
                Some(expected.as_ref()?.cmp_precedence(&version) == Ordering::Equal)
            }
            MatcherKind::GreaterThanOrEqualToSemver(expected) => {
                let version = parse_input_semver(&input?)?;
                Some(version.cmp_precedence(expected.as_ref()?) != Ordering::Less)
            }
            MatcherKind::LessThanOrEqualToSemver(expected) => {
                let version = parse_input_semver(&input?)?;
                Some(version.cmp_precedence(expected.as_ref()?) != Ordering::Greater)
            }
            MatcherKind::BetweenSemver(bounds) => {
                let version = parse_input_semver(&input?)?;
                let (start, end) = bounds.as_ref()?;
                Some(
                    version.cmp_precedence(start) != Ordering::Less
                        && version.cmp_precedence(end) != Ordering::Greater,
                )
            }
            MatcherKind::InListSemver(list) => {
                let version = parse_input_semver(&input?)?;
                Some(list.iter().any(|v| v.cmp_precedence(&version) == Ordering::Equal))
            }

            MatcherKind::Unsupported(_) => Some(false),
        }
    }
}

fn compare_numeric(
    input: &MatchInput,
    data_type: DataType,
    check: impl FnOnce(f64) -> bool,
) -> Option<bool> {
    let raw = input.as_number()?;
    let normalized = match data_type {
        DataType::Number => raw,
        DataType::Datetime => data_type.normalize(raw as i64) as f64,
    };
    Some(check(normalized))
}

fn to_owned_set(input: &MatchInput) -> Option<HashSet<String>> {
    Some(
        input
            .as_string_set()?
            .into_iter()
            .map(str::to_owned)
            .collect(),
    )
}

fn parse_input_semver(input: &MatchInput) -> Option<Version> {
    Version::parse(input.as_str()?.trim()).ok()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::splits::models::parse_semver;

    struct NoScope;

    impl MatcherScope for NoScope {
        fn segment_contains(&self, segment: &str, key: &str) -> bool {
            segment == "employees" && key == "alice"
        }

        fn large_segment_contains(&self, _segment: &str, _key: &str) -> bool {
            false
        }

        fn dependency_treatment(
            &self,
            split: &str,
            _key: &Key,
            _attributes: Option<&Attributes>,
            _depth: u8,
        ) -> Option<String> {
            (split == "parent").then(|| "on".to_owned())
        }
    }

    fn eval(matcher: &Matcher, key: &str, attributes: Option<&Attributes>) -> bool {
        let key = Key::new(key);
        matcher.evaluate(&EvalContext {
            key: &key,
            attributes,
            scope: &NoScope,
            depth: 0,
        })
    }

    fn matcher(kind: MatcherKind) -> Matcher {
        Matcher {
            negate: false,
            attribute: None,
            kind,
        }
    }

    fn attr_matcher(attribute: &str, kind: MatcherKind) -> Matcher {
        Matcher {
            negate: false,
            attribute: Some(attribute.to_owned()),
            kind,
        }
    }

    #[test]
    fn all_keys_always_matches() {
        assert!(eval(&matcher(MatcherKind::AllKeys), "anyone", None));
    }

    #[test]
    fn whitelist_checks_matching_key() {
        let m = matcher(MatcherKind::Whitelist(
            ["alice".to_owned()].into_iter().collect(),
        ));
        assert!(eval(&m, "alice", None));
        assert!(!eval(&m, "bob", None));
    }

    #[test]
    fn negation_inverts_the_match() {
        let m = Matcher {
            negate: true,
            attribute: None,
            kind: MatcherKind::Whitelist(["alice".to_owned()].into_iter().collect()),
        };
        assert!(!eval(&m, "alice", None));
        assert!(eval(&m, "bob", None));
    }

    #[test]
    fn in_segment_consults_the_scope() {
        let m = matcher(MatcherKind::InSegment("employees".to_owned()));
        assert!(eval(&m, "alice", None));
        assert!(!eval(&m, "bob", None));

        let m = matcher(MatcherKind::InSegment("missing".to_owned()));
        assert!(!eval(&m, "alice", None));
    }

    #[test]
    fn numeric_matchers_coerce_and_compare() {
        let m = attr_matcher(
            "age",
            MatcherKind::GreaterThanOrEqualTo {
                data_type: DataType::Number,
                value: 18,
            },
        );
        let attrs: Attributes = HashMap::from([("age".to_owned(), 21.0.into())]);
        assert!(eval(&m, "alice", Some(&attrs)));

        let attrs: Attributes = HashMap::from([("age".to_owned(), "17".into())]);
        assert!(!eval(&m, "alice", Some(&attrs)));

        // Non-numeric attribute fails the matcher.
        let attrs: Attributes = HashMap::from([("age".to_owned(), true.into())]);
        assert!(!eval(&m, "alice", Some(&attrs)));

        // Missing attribute fails the matcher.
        assert!(!eval(&m, "alice", None));
    }

    #[test]
    fn between_is_inclusive() {
        let m = attr_matcher(
            "age",
            MatcherKind::Between {
                data_type: DataType::Number,
                start: 18,
                end: 65,
            },
        );
        for (age, expected) in [(17.0, false), (18.0, true), (65.0, true), (66.0, false)] {
            let attrs: Attributes = HashMap::from([("age".to_owned(), age.into())]);
            assert_eq!(eval(&m, "alice", Some(&attrs)), expected, "age {age}");
        }
    }

    #[test]
    fn datetime_comparison_truncates_to_minute() {
        let m = attr_matcher(
            "registered",
            MatcherKind::EqualTo {
                data_type: DataType::Datetime,
                value: DataType::Datetime.normalize(1675443537882),
            },
        );
        // Same minute, different second.
        let attrs: Attributes =
            HashMap::from([("registered".to_owned(), 1675443492000i64.into())]);
        assert!(eval(&m, "alice", Some(&attrs)));
        // One minute later.
        let attrs: Attributes =
            HashMap::from([("registered".to_owned(), 1675443540000i64.into())]);
        assert!(!eval(&m, "alice", Some(&attrs)));
    }

    #[test]
    fn set_matchers() {
        let expected: HashSet<String> = ["a".to_owned(), "b".to_owned()].into_iter().collect();
        let attrs: Attributes = HashMap::from([(
            "perms".to_owned(),
            AttributeValue::List(vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]),
        )]);

        assert!(!eval(
            &attr_matcher("perms", MatcherKind::EqualToSet(expected.clone())),
            "k",
            Some(&attrs)
        ));
        assert!(eval(
            &attr_matcher("perms", MatcherKind::ContainsAllOfSet(expected.clone())),
            "k",
            Some(&attrs)
        ));
        assert!(eval(
            &attr_matcher("perms", MatcherKind::ContainsAnyOfSet(expected.clone())),
            "k",
            Some(&attrs)
        ));
        assert!(!eval(
            &attr_matcher("perms", MatcherKind::PartOfSet(expected)),
            "k",
            Some(&attrs)
        ));
    }

    #[test]
    fn string_matchers() {
        let attrs: Attributes = HashMap::from([("email".to_owned(), "alice@corp.com".into())]);
        assert!(eval(
            &attr_matcher("email", MatcherKind::StartsWith(vec!["alice".to_owned()])),
            "k",
            Some(&attrs)
        ));
        assert!(eval(
            &attr_matcher("email", MatcherKind::EndsWith(vec!["corp.com".to_owned()])),
            "k",
            Some(&attrs)
        ));
        assert!(eval(
            &attr_matcher("email", MatcherKind::ContainsString(vec!["@".to_owned()])),
            "k",
            Some(&attrs)
        ));
        assert!(eval(
            &attr_matcher(
                "email",
                MatcherKind::MatchesString(regex::Regex::new("^alice.*com$").ok()),
            ),
            "k",
            Some(&attrs)
        ));
        // An unparseable pattern compiled to None never matches.
        assert!(!eval(
            &attr_matcher("email", MatcherKind::MatchesString(None)),
            "k",
            Some(&attrs)
        ));
    }

    #[test]
    fn boolean_matcher_accepts_string_forms() {
        let m = attr_matcher("beta", MatcherKind::EqualToBoolean(true));
        let attrs: Attributes = HashMap::from([("beta".to_owned(), true.into())]);
        assert!(eval(&m, "k", Some(&attrs)));
        let attrs: Attributes = HashMap::from([("beta".to_owned(), "True".into())]);
        assert!(eval(&m, "k", Some(&attrs)));
        let attrs: Attributes = HashMap::from([("beta".to_owned(), 1.0.into())]);
        assert!(!eval(&m, "k", Some(&attrs)));
    }

    #[test]
    fn dependency_matcher_compares_parent_treatment() {
        let m = matcher(MatcherKind::InSplitTreatment {
            split: "parent".to_owned(),
            treatments: vec!["on".to_owned()],
        });
        assert!(eval(&m, "alice", None));

        let m = matcher(MatcherKind::InSplitTreatment {
            split: "missing".to_owned(),
            treatments: vec!["on".to_owned()],
        });
        assert!(!eval(&m, "alice", None));
    }

    #[test]
    fn semver_matchers() {
        let attrs = |v: &str| -> Attributes { HashMap::from([("version".to_owned(), v.into())]) };

        let gte = attr_matcher(
            "version",
            MatcherKind::GreaterThanOrEqualToSemver(parse_semver("2.1.0")),
        );
        assert!(eval(&gte, "k", Some(&attrs("2.1.0"))));
        assert!(eval(&gte, "k", Some(&attrs("2.10.0"))));
        assert!(!eval(&gte, "k", Some(&attrs("2.0.9"))));
        // Build metadata is ignored in ordering.
        assert!(eval(&gte, "k", Some(&attrs("2.1.0+build.7"))));
        // Pre-release sorts below the release.
        assert!(!eval(&gte, "k", Some(&attrs("2.1.0-rc.1"))));
        // Unparseable input fails the matcher.
        assert!(!eval(&gte, "k", Some(&attrs("not-a-version"))));

        let between = attr_matcher(
            "version",
            MatcherKind::BetweenSemver(parse_semver("1.0.0").zip(parse_semver("2.0.0"))),
        );
        assert!(eval(&between, "k", Some(&attrs("1.5.3"))));
        assert!(!eval(&between, "k", Some(&attrs("2.0.1"))));

        let in_list = attr_matcher(
            "version",
            MatcherKind::InListSemver(vec![
                parse_semver("1.0.0").unwrap(),
                parse_semver("1.1.0").unwrap(),
            ]),
        );
        assert!(eval(&in_list, "k", Some(&attrs("1.1.0"))));
        assert!(!eval(&in_list, "k", Some(&attrs("1.2.0"))));
    }

    #[test]
    fn unsupported_matcher_never_matches() {
        let m = matcher(MatcherKind::Unsupported("NEW_MATCHER".to_owned()));
        assert!(!eval(&m, "alice", None));
    }
}
