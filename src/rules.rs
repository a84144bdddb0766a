//! Deterministic, client-side rule evaluation and consistent-hash rollout.

use sha2::{Digest, Sha256};

use crate::user::UserContext;

/// Condition operators supported by targeting rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
	/// Case-insensitive string equality.
	Equals,
	/// Negation of [`Operator::Equals`].
	NotEquals,
	/// Case-insensitive substring match.
	Contains,
	/// Negation of [`Operator::Contains`].
	NotContains,
	/// Case-insensitive prefix match.
	StartsWith,
	/// Case-insensitive suffix match.
	EndsWith,
	/// Case-insensitive membership in a comma-separated list.
	In,
	/// Negation of [`Operator::In`].
	NotIn,
	/// Numeric greater-than.
	GreaterThan,
	/// Numeric greater-than-or-equal.
	GreaterEqual,
	/// Numeric less-than.
	LessThan,
	/// Numeric less-than-or-equal.
	LessEqual,
	/// Regular expression match.
	Regex,
	/// Semantic-version greater-than.
	SemverGt,
	/// Semantic-version less-than.
	SemverLt,
	/// Semantic-version equality.
	SemverEq,
	/// The attribute is present and non-empty.
	IsSet,
	/// The attribute is absent or empty.
	IsNotSet,
}

/// A single attribute condition within a targeting rule.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Condition {
	/// Attribute name; `id` and `email` resolve to [`UserContext`] top-level fields.
	pub attribute: String,
	/// Comparison operator.
	pub operator: Operator,
	/// Configured comparison value, always compared as a string or parsed as needed.
	#[serde(default)]
	pub value: String,
}

/// An ordered, conditionally-matched rollout rule.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct TargetingRule {
	/// Stable rule identifier, surfaced in [`EvaluationReason::RuleMatch`].
	pub id: String,
	/// Optional human-readable name.
	#[serde(default)]
	pub name: Option<String>,
	/// Whether this rule is considered at all.
	#[serde(default)]
	pub enabled: bool,
	/// Rollout percentage in `[0, 100]` applied once all conditions match.
	#[serde(default)]
	pub rollout: i32,
	/// All conditions must match (AND) for the rule to apply.
	#[serde(default)]
	pub conditions: Vec<Condition>,
}

/// Server-side definition of a single flag's targeting policy.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct FlagRule {
	/// Flag key this rule governs.
	pub key: String,
	/// Master enable switch; `false` short-circuits to `OFF`.
	#[serde(default)]
	pub enabled: bool,
	/// Default rollout percentage used once no targeting rule matches.
	#[serde(default)]
	pub rollout: i32,
	/// User ids granted `true` unconditionally.
	#[serde(default)]
	pub target_users: Vec<String>,
	/// Ordered targeting rules; first match wins.
	#[serde(default)]
	pub rules: Vec<TargetingRule>,
}

/// Error sub-kind carried by [`EvaluationReason::Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	/// No server rule exists for the requested flag key.
	FlagNotFound,
	/// The rule payload could not be interpreted.
	MalformedFlag,
	/// Evaluation required a user id that was not supplied.
	UserNotSpecified,
	/// The client has not completed its initial fetch.
	ClientNotReady,
	/// An unexpected internal failure occurred during evaluation.
	Exception,
}

/// Explanation of why a flag evaluated to its returned value.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaluationReason {
	/// The rule is disabled.
	Off,
	/// The user id matched an explicit target list.
	TargetMatch,
	/// A targeting rule matched.
	RuleMatch {
		/// Matching rule id.
		rule_id: String,
		/// Index of the matching rule within `rules`.
		rule_index: usize,
		/// Whether the rollout hash admitted this user.
		in_rollout: bool,
	},
	/// No targeting rule matched; the default rollout decided the outcome.
	Fallthrough {
		/// Whether the rollout hash admitted this user.
		in_rollout: bool,
	},
	/// Evaluation could not proceed normally.
	Error {
		/// Specific failure kind.
		kind: ErrorKind,
	},
	/// The flag key is unrecognized.
	Unknown,
}

/// Compute whether `(flagKey, userId)` falls within `percentage` using a
/// SHA-256-derived, deterministic, approximately uniform hash bucket.
///
/// Implementations must not substitute a non-cryptographic hash: uniform
/// distribution across arbitrary user-id domains is a property callers
/// depend on.
pub fn is_in_rollout(flag_key: &str, user_id: &str, percentage: i32) -> bool {
	let mut hasher = Sha256::new();
	hasher.update(flag_key.as_bytes());
	hasher.update(b":");
	hasher.update(user_id.as_bytes());
	let digest = hasher.finalize();
	let bucket = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 100;
	(bucket as i32) < percentage
}

/// Evaluate a single flag rule against a user, discarding the reason.
pub fn evaluate(rule: &FlagRule, user: &UserContext) -> bool {
	evaluate_with_reason(rule, user).0
}

/// Evaluate a single flag rule against a user, following the ordered policy:
/// disabled check, explicit target list, first matching targeting rule,
/// then the default rollout.
pub fn evaluate_with_reason(rule: &FlagRule, user: &UserContext) -> (bool, EvaluationReason) {
	if !rule.enabled {
		return (false, EvaluationReason::Off);
	}

	if !user.id.is_empty() && rule.target_users.iter().any(|id| id == &user.id) {
		return (true, EvaluationReason::TargetMatch);
	}

	for (index, targeting_rule) in rule.rules.iter().enumerate() {
		if !targeting_rule.enabled || !conditions_match(&targeting_rule.conditions, user) {
			continue;
		}

		let (value, in_rollout) = rollout_outcome(&rule.key, &user.id, targeting_rule.rollout);
		return (
			value,
			EvaluationReason::RuleMatch { rule_id: targeting_rule.id.clone(), rule_index: index, in_rollout },
		);
	}

	if rule.rollout >= 100 {
		return (true, EvaluationReason::Fallthrough { in_rollout: true });
	}
	if rule.rollout <= 0 || user.id.is_empty() {
		return (false, EvaluationReason::Fallthrough { in_rollout: false });
	}

	let in_rollout = is_in_rollout(&rule.key, &user.id, rule.rollout);
	(in_rollout, EvaluationReason::Fallthrough { in_rollout })
}

fn rollout_outcome(flag_key: &str, user_id: &str, percentage: i32) -> (bool, bool) {
	if percentage >= 100 {
		(true, true)
	} else if percentage <= 0 {
		(false, false)
	} else {
		let in_rollout = is_in_rollout(flag_key, user_id, percentage);
		(in_rollout, in_rollout)
	}
}

fn conditions_match(conditions: &[Condition], user: &UserContext) -> bool {
	if conditions.is_empty() {
		return false;
	}
	conditions.iter().all(|condition| condition_matches(condition, user))
}

fn condition_matches(condition: &Condition, user: &UserContext) -> bool {
	let resolved = user.resolve(&condition.attribute);
	let is_unset = resolved.as_deref().map(str::is_empty).unwrap_or(true);

	match condition.operator {
		Operator::IsSet => return !is_unset,
		Operator::IsNotSet => return is_unset,
		_ if is_unset => return false,
		_ => {}
	}
	let value = resolved.expect("checked not unset above");

	match condition.operator {
		Operator::Equals => eq_ci(&value, &condition.value),
		Operator::NotEquals => !eq_ci(&value, &condition.value),
		Operator::Contains => value.to_lowercase().contains(&condition.value.to_lowercase()),
		Operator::NotContains => !value.to_lowercase().contains(&condition.value.to_lowercase()),
		Operator::StartsWith => value.to_lowercase().starts_with(&condition.value.to_lowercase()),
		Operator::EndsWith => value.to_lowercase().ends_with(&condition.value.to_lowercase()),
		Operator::In => split_csv(&condition.value).iter().any(|item| eq_ci(&value, item)),
		Operator::NotIn => !split_csv(&condition.value).iter().any(|item| eq_ci(&value, item)),
		Operator::GreaterThan | Operator::GreaterEqual | Operator::LessThan | Operator::LessEqual => {
			match (value.trim().parse::<f64>(), condition.value.trim().parse::<f64>()) {
				(Ok(lhs), Ok(rhs)) => match condition.operator {
					Operator::GreaterThan => lhs > rhs,
					Operator::GreaterEqual => lhs >= rhs,
					Operator::LessThan => lhs < rhs,
					Operator::LessEqual => lhs <= rhs,
					_ => unreachable!(),
				},
				_ => false,
			}
		}
		Operator::Regex => regex::Regex::new(&condition.value).map(|re| re.is_match(&value)).unwrap_or(false),
		Operator::SemverGt => {
			semver_cmp(&value, &condition.value).map(|order| order.is_gt()).unwrap_or(false)
		}
		Operator::SemverLt => {
			semver_cmp(&value, &condition.value).map(|order| order.is_lt()).unwrap_or(false)
		}
		Operator::SemverEq => {
			semver_cmp(&value, &condition.value).map(|order| order.is_eq()).unwrap_or(false)
		}
		Operator::IsSet | Operator::IsNotSet => unreachable!("handled above"),
	}
}

fn eq_ci(a: &str, b: &str) -> bool {
	a.to_lowercase() == b.to_lowercase()
}

fn split_csv(value: &str) -> Vec<String> {
	value.split(',').map(|part| part.trim().to_owned()).collect()
}

fn semver_cmp(a: &str, b: &str) -> Option<std::cmp::Ordering> {
	let left = parse_semver(a)?;
	let right = parse_semver(b)?;
	let len = left.len().max(right.len());
	for index in 0..len {
		let lhs = left.get(index).copied().unwrap_or(0);
		let rhs = right.get(index).copied().unwrap_or(0);
		match lhs.cmp(&rhs) {
			std::cmp::Ordering::Equal => continue,
			other => return Some(other),
		}
	}
	Some(std::cmp::Ordering::Equal)
}

fn parse_semver(raw: &str) -> Option<Vec<u64>> {
	let trimmed = raw.trim().trim_start_matches(['v', 'V']);
	trimmed.split('.').map(|part| part.parse::<u64>().ok()).collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use std::collections::HashMap;

	proptest! {
		#[test]
		fn rollout_is_deterministic_for_arbitrary_inputs(
			flag_key in "[a-z]{1,12}",
			user_id in "[a-zA-Z0-9_-]{0,24}",
			percentage in 0i32..=100,
		) {
			let first = is_in_rollout(&flag_key, &user_id, percentage);
			let second = is_in_rollout(&flag_key, &user_id, percentage);
			prop_assert_eq!(first, second);
		}

		#[test]
		fn rollout_respects_the_extremes(flag_key in "[a-z]{1,12}", user_id in "[a-zA-Z0-9_-]{0,24}") {
			prop_assert!(!is_in_rollout(&flag_key, &user_id, 0));
			prop_assert!(is_in_rollout(&flag_key, &user_id, 100));
		}
	}

	#[test]
	fn rollout_is_deterministic() {
		let first = is_in_rollout("feature", "user-1", 50);
		let second = is_in_rollout("feature", "user-1", 50);
		assert_eq!(first, second);
	}

	#[test]
	fn rollout_is_monotonic() {
		let admitted_at: Vec<i32> =
			(0..=100).filter(|p| is_in_rollout("feature", "user-42", *p)).collect();
		if let (Some(first), Some(last)) = (admitted_at.first(), admitted_at.last()) {
			let expected: Vec<i32> = (*first..=*last).collect();
			assert_eq!(admitted_at, expected, "admission set must be a contiguous prefix");
		}
	}

	#[test]
	fn rollout_is_approximately_uniform() {
		let admitted =
			(0..10_000).filter(|n| is_in_rollout("feature", &format!("user-{n}"), 50)).count();
		let fraction = admitted as f64 / 10_000.0;
		assert!((0.45..=0.55).contains(&fraction), "fraction {fraction} out of range");
	}

	#[test]
	fn scenario_b_targeted_user() {
		let rule = FlagRule {
			key: "feature".into(),
			enabled: true,
			rollout: 0,
			target_users: vec!["u-vip".into()],
			rules: vec![],
		};

		let vip = UserContext::new("u-vip");
		let (value, reason) = evaluate_with_reason(&rule, &vip);
		assert!(value);
		assert_eq!(reason, EvaluationReason::TargetMatch);

		let other = UserContext::new("u-other");
		let (value, reason) = evaluate_with_reason(&rule, &other);
		assert!(!value);
		assert_eq!(reason, EvaluationReason::Fallthrough { in_rollout: false });
	}

	#[test]
	fn scenario_c_rule_plus_rollout() {
		let rule = FlagRule {
			key: "feature".into(),
			enabled: true,
			rollout: 0,
			target_users: vec![],
			rules: vec![TargetingRule {
				id: "pro-rollout".into(),
				name: None,
				enabled: true,
				rollout: 50,
				conditions: vec![Condition {
					attribute: "plan".into(),
					operator: Operator::Equals,
					value: "pro".into(),
				}],
			}],
		};

		let matches = (0..1000)
			.filter(|n| {
				let user = UserContext::new(format!("user-{n}")).with_attribute("plan", "pro");
				evaluate(&rule, &user)
			})
			.count();
		assert!((450..=550).contains(&matches), "matches {matches} out of range");
	}

	#[test]
	fn disabled_rule_is_always_off() {
		let rule = FlagRule { key: "x".into(), enabled: false, rollout: 100, ..Default::default() };
		let (value, reason) = evaluate_with_reason(&rule, &UserContext::new("anyone"));
		assert!(!value);
		assert_eq!(reason, EvaluationReason::Off);
	}

	#[test]
	fn empty_condition_list_never_matches() {
		let rule = TargetingRule { id: "r".into(), enabled: true, rollout: 100, ..Default::default() };
		assert!(!conditions_match(&rule.conditions, &UserContext::new("u")));
	}

	#[test]
	fn is_set_and_is_not_set_treat_empty_string_as_unset() {
		let user = UserContext::new("u").with_attribute("plan", "");
		let is_set = Condition { attribute: "plan".into(), operator: Operator::IsSet, value: String::new() };
		let is_not_set =
			Condition { attribute: "plan".into(), operator: Operator::IsNotSet, value: String::new() };
		assert!(!condition_matches(&is_set, &user));
		assert!(condition_matches(&is_not_set, &user));
	}

	#[test]
	fn string_operators_are_case_insensitive() {
		let user = UserContext::new("u").with_attribute("plan", "PRO");
		let condition =
			Condition { attribute: "plan".into(), operator: Operator::Equals, value: "pro".into() };
		assert!(condition_matches(&condition, &user));
	}

	#[test]
	fn in_operator_splits_and_trims_csv() {
		let user = UserContext::new("u").with_attribute("plan", "pro");
		let condition =
			Condition { attribute: "plan".into(), operator: Operator::In, value: " free, pro , team".into() };
		assert!(condition_matches(&condition, &user));
	}

	#[test]
	fn numeric_operator_fails_on_parse_error() {
		let user = UserContext::new("u").with_attribute("age", "not-a-number");
		let condition =
			Condition { attribute: "age".into(), operator: Operator::GreaterThan, value: "10".into() };
		assert!(!condition_matches(&condition, &user));
	}

	#[test]
	fn semver_pads_shorter_versions() {
		assert_eq!(semver_cmp("1.2", "1.2.0"), Some(std::cmp::Ordering::Equal));
		assert_eq!(semver_cmp("v2.0.0", "1.9.9"), Some(std::cmp::Ordering::Greater));
		assert_eq!(semver_cmp("1.x", "1.0"), None);
	}

	#[test]
	fn bulk_evaluation_iterates_all_rules() {
		let mut rules = HashMap::new();
		rules.insert(
			"a".to_string(),
			FlagRule { key: "a".into(), enabled: true, rollout: 100, ..Default::default() },
		);
		rules.insert(
			"b".to_string(),
			FlagRule { key: "b".into(), enabled: false, rollout: 100, ..Default::default() },
		);

		let user = UserContext::new("u");
		let results: HashMap<String, bool> =
			rules.iter().map(|(key, rule)| (key.clone(), evaluate(rule, &user))).collect();

		assert_eq!(results.get("a"), Some(&true));
		assert_eq!(results.get("b"), Some(&false));
	}
}
