//! Typed commands and reply classification for the ide protocol.
//!
//! Commands are built from fixed envelope templates with every free-text
//! parameter escaped as leaf content — the statement payload of `Add` is
//! never concatenated as markup. Replies are classified by root tag into
//! the three shapes the protocol produces, with query helpers for the
//! handful of reply structures the session driver cares about.

use std::fmt;

use crate::error::ProtocolError;
use crate::xml::{self, Element};

/// Opaque identifier the prover assigns to a point in its commit history.
/// Compared for equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateId(String);

impl StateId {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The five commands the session driver issues.
#[derive(Debug)]
pub(crate) enum Command<'a> {
    Init,
    Status,
    Goal,
    Add { sentence: &'a str, tip: &'a StateId },
    EditAt { state_id: &'a StateId },
}

impl Command<'_> {
    /// Wire envelope for this command, parameter substitution only.
    pub fn wire(&self) -> String {
        match self {
            Self::Init => r#"<call val="Init"> <option val="none"/> </call>"#.to_string(),
            Self::Status => r#"<call val="Status"> <bool val="true"/> </call>"#.to_string(),
            Self::Goal => r#"<call val="Goal"> <unit/> </call>"#.to_string(),
            Self::Add { sentence, tip } => format!(
                r#"<call val="Add"> <pair> <pair> <string>{}</string> <int>0</int> </pair> <pair> <state_id val="{}"/> <bool val="false"/> </pair> </pair> </call>"#,
                xml::escape(sentence),
                xml::escape(tip.as_str()),
            ),
            Self::EditAt { state_id } => format!(
                r#"<call val="Edit_at"> <state_id val="{}"/> </call>"#,
                xml::escape(state_id.as_str()),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Good,
    Fail,
}

/// A reply envelope, tagged by root element.
#[derive(Debug)]
pub(crate) enum Reply {
    /// Terminal reply for the in-flight command.
    Value(ValueReply),
    /// Out-of-band progress/diagnostic wrapper.
    Feedback(Element),
    /// Bare message; older prover versions emit these outside `feedback`.
    Message(Element),
}

impl Reply {
    pub fn parse(envelope: &str) -> Result<Self, ProtocolError> {
        let root = xml::parse(&xml::normalize(envelope))?;
        match root.name.as_str() {
            "value" => {
                let outcome = match root.attr("val") {
                    Some("good") => Outcome::Good,
                    Some("fail") => Outcome::Fail,
                    other => {
                        return Err(ProtocolError::Malformed(format!(
                            "value reply with outcome {other:?}"
                        )));
                    }
                };
                Ok(Self::Value(ValueReply { outcome, root }))
            }
            "feedback" => Ok(Self::Feedback(root)),
            "message" => Ok(Self::Message(root)),
            other => Err(ProtocolError::Malformed(format!(
                "unrecognized reply root <{other}>"
            ))),
        }
    }

    /// The `message` element carried by this reply, if any: the root for a
    /// bare message, or the first nested one inside a `feedback` wrapper.
    pub fn message(&self) -> Option<&Element> {
        match self {
            Self::Message(el) => Some(el),
            Self::Feedback(el) => el.descendant("message"),
            Self::Value(_) => None,
        }
    }
}

/// Level and body of a `message` element. `None` if either part is
/// missing — some feedback kinds reuse the tag without a payload.
pub(crate) fn message_parts(message: &Element) -> Option<(&str, String)> {
    let level = message.child("message_level")?.attr("val")?;
    let body = message.child("richpp")?.text();
    Some((level, body))
}

/// The terminal `value` reply of a command.
#[derive(Debug)]
pub(crate) struct ValueReply {
    outcome: Outcome,
    root: Element,
}

impl ValueReply {
    pub fn is_good(&self) -> bool {
        self.outcome == Outcome::Good
    }

    /// State id of an `Init` reply.
    pub fn initial_state_id(&self) -> Option<StateId> {
        self.root
            .child("state_id")?
            .attr("val")
            .map(StateId::new)
    }

    /// New tip from a good `Add` reply. The prover uses two shapes: the
    /// state id usually sits directly under the outer pair, but when the
    /// statement closed a focused proof it is nested inside a `union`.
    pub fn next_tip(&self) -> Option<StateId> {
        if !self.is_good() {
            return None;
        }
        let pair = self.root.child("pair")?;
        pair.child("pair")
            .and_then(|inner| inner.child("union"))
            .and_then(|union| union.child("state_id"))
            .or_else(|| pair.child("state_id"))?
            .attr("val")
            .map(StateId::new)
    }

    /// Rich error payload of a failure reply, if present.
    pub fn failure_payload(&self) -> Option<&Element> {
        if self.outcome == Outcome::Fail {
            self.root.child("richpp")
        } else {
            None
        }
    }

    /// Name of the proof in progress, from a `Status` reply.
    pub fn proof_name(&self) -> Option<String> {
        let string = self
            .root
            .child("status")?
            .child("option")?
            .child("string")?;
        Some(string.text())
    }

    /// Goal state from a `Goal` reply. `None` when no proof is open
    /// (`option val="none"`); an empty set when the proof is complete.
    pub fn goal_set(&self) -> Option<GoalSet> {
        let goals = self.root.child("option")?.child("goals")?;
        let foreground = goals.child("list")?;
        let goals = foreground
            .children_named("goal")
            .map(|goal| Goal {
                hypotheses: goal
                    .child("list")
                    .map(|list| list.children_named("richpp").map(Element::text).collect())
                    .unwrap_or_default(),
                conclusion: goal.child("richpp").map(Element::text).unwrap_or_default(),
            })
            .collect();
        Some(GoalSet { goals })
    }
}

/// One goal: hypotheses in context order plus the conclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Goal {
    pub hypotheses: Vec<String>,
    pub conclusion: String,
}

/// Ordered goal sequence; the first goal is focused.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct GoalSet {
    pub goals: Vec<Goal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(envelope: &str) -> ValueReply {
        match Reply::parse(envelope).unwrap() {
            Reply::Value(v) => v,
            other => panic!("expected value reply, got {other:?}"),
        }
    }

    #[test]
    fn test_fixed_command_wires() {
        assert_eq!(
            Command::Init.wire(),
            r#"<call val="Init"> <option val="none"/> </call>"#
        );
        assert_eq!(
            Command::Status.wire(),
            r#"<call val="Status"> <bool val="true"/> </call>"#
        );
        assert_eq!(Command::Goal.wire(), r#"<call val="Goal"> <unit/> </call>"#);
    }

    #[test]
    fn test_edit_at_wire() {
        let id = StateId::new("7");
        assert_eq!(
            Command::EditAt { state_id: &id }.wire(),
            r#"<call val="Edit_at"> <state_id val="7"/> </call>"#
        );
    }

    #[test]
    fn test_add_wire_structure() {
        let tip = StateId::new("3");
        let wire = Command::Add {
            sentence: "Lemma a : True.",
            tip: &tip,
        }
        .wire();
        assert_eq!(
            wire,
            r#"<call val="Add"> <pair> <pair> <string>Lemma a : True.</string> <int>0</int> </pair> <pair> <state_id val="3"/> <bool val="false"/> </pair> </pair> </call>"#
        );
    }

    #[test]
    fn test_add_wire_escapes_statement_text() {
        let tip = StateId::new("3");
        let wire = Command::Add {
            sentence: "Check (1 < 2 /\\ true <> false).",
            tip: &tip,
        }
        .wire();
        assert!(wire.contains("<string>Check (1 &lt; 2 /\\ true &lt;&gt; false).</string>"));
        // The raw text must not appear as markup.
        assert!(!wire.contains("1 < 2"));
    }

    #[test]
    fn test_init_reply_state_id() {
        let reply = value(r#"<value val="good"><state_id val="1"/></value>"#);
        assert!(reply.is_good());
        assert_eq!(reply.initial_state_id(), Some(StateId::new("1")));
    }

    #[test]
    fn test_next_tip_direct_shape() {
        let reply = value(
            r#"<value val="good"><pair><state_id val="4"/><pair><union val="in_l"><unit/></union><string></string></pair></pair></value>"#,
        );
        assert_eq!(reply.next_tip(), Some(StateId::new("4")));
    }

    #[test]
    fn test_next_tip_union_shape_preferred() {
        let reply = value(
            r#"<value val="good"><pair><state_id val="4"/><pair><union val="in_r"><state_id val="6"/></union><string></string></pair></pair></value>"#,
        );
        assert_eq!(reply.next_tip(), Some(StateId::new("6")));
    }

    #[test]
    fn test_next_tip_none_on_fail() {
        let reply = value(r#"<value val="fail"><richpp>nope</richpp></value>"#);
        assert_eq!(reply.next_tip(), None);
    }

    #[test]
    fn test_failure_payload() {
        let reply = value(
            r#"<value val="fail" loc_s="0" loc_e="3"><state_id val="2"/><richpp>Syntax error</richpp></value>"#,
        );
        assert_eq!(reply.failure_payload().unwrap().text(), "Syntax error");
    }

    #[test]
    fn test_failure_payload_absent_on_good() {
        let reply = value(r#"<value val="good"><state_id val="1"/></value>"#);
        assert!(reply.failure_payload().is_none());
    }

    #[test]
    fn test_unknown_outcome_is_malformed() {
        assert!(Reply::parse(r#"<value val="odd"><unit/></value>"#).is_err());
    }

    #[test]
    fn test_unknown_root_is_malformed() {
        assert!(Reply::parse("<call val=\"Init\"/>").is_err());
    }

    #[test]
    fn test_message_unwrapping_from_feedback() {
        let reply = Reply::parse(
            r#"<feedback object="state"><state_id val="2"/><feedback_content val="message"><message><message_level val="warning"/><option val="none"/><richpp>deprecated</richpp></message></feedback_content></feedback>"#,
        )
        .unwrap();
        let (level, body) = message_parts(reply.message().unwrap()).unwrap();
        assert_eq!(level, "warning");
        assert_eq!(body, "deprecated");
    }

    #[test]
    fn test_message_unwrapping_bare_root() {
        let reply = Reply::parse(
            r#"<message><message_level val="notice"/><richpp>hello</richpp></message>"#,
        )
        .unwrap();
        let (level, body) = message_parts(reply.message().unwrap()).unwrap();
        assert_eq!(level, "notice");
        assert_eq!(body, "hello");
    }

    #[test]
    fn test_nbsp_normalized_before_parse() {
        let reply = Reply::parse(
            "<message><message_level val=\"notice\"/><richpp>a&nbsp;b</richpp></message>",
        )
        .unwrap();
        let (_, body) = message_parts(reply.message().unwrap()).unwrap();
        assert_eq!(body, "a b");
    }

    #[test]
    fn test_proof_name_from_status() {
        let reply = value(
            r#"<value val="good"><status><list/><option val="some"><string>easy_lemma</string></option><list/><int>0</int></status></value>"#,
        );
        assert_eq!(reply.proof_name(), Some("easy_lemma".to_string()));
    }

    #[test]
    fn test_proof_name_absent_outside_proof() {
        let reply = value(
            r#"<value val="good"><status><list/><option val="none"/><list/><int>0</int></status></value>"#,
        );
        assert_eq!(reply.proof_name(), None);
    }

    #[test]
    fn test_goal_set_none_outside_proof() {
        let reply = value(r#"<value val="good"><option val="none"/></value>"#);
        assert!(reply.goal_set().is_none());
    }

    #[test]
    fn test_goal_set_empty_when_proof_complete() {
        let reply = value(
            r#"<value val="good"><option val="some"><goals><list/><list/><list/><list/></goals></option></value>"#,
        );
        let set = reply.goal_set().unwrap();
        assert!(set.goals.is_empty());
    }

    #[test]
    fn test_goal_set_hypotheses_and_conclusions() {
        let reply = value(
            r#"<value val="good"><option val="some"><goals><list><goal><string>3</string><list><richpp>H : nat</richpp></list><richpp>0 = 0</richpp></goal><goal><string>4</string><list/><richpp>1 = 1</richpp></goal></list><list/><list/><list/></goals></option></value>"#,
        );
        let set = reply.goal_set().unwrap();
        assert_eq!(set.goals.len(), 2);
        assert_eq!(set.goals[0].hypotheses, vec!["H : nat"]);
        assert_eq!(set.goals[0].conclusion, "0 = 0");
        assert!(set.goals[1].hypotheses.is_empty());
        assert_eq!(set.goals[1].conclusion, "1 = 1");
    }
}
