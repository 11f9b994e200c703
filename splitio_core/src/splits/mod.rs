//! Feature-flag definitions: the wire model, matcher evaluation, and the
//! bucket-to-treatment splitter.
pub mod matchers;
pub mod models;
pub mod splitter;

pub use matchers::{EvalContext, MatcherScope, MAX_DEPENDENCY_DEPTH};
pub use models::{
    ChangeNumber, Condition, ConditionType, Matcher, MatcherKind, Partition, Split, SplitChanges,
    SplitChangesResponse, Status, TryParse,
};
