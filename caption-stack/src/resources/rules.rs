//! Event-bus rules.

use super::{FunctionRef, ServicePrincipal};
use crate::core::Expr;
use crate::errors::SynthResult;
use crate::events::EventPattern;
use crate::stack::StackBuilder;
use crate::template::{types, Resource};

/// A rule forwarding matching events to one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRuleSpec {
    /// Logical ID.
    pub logical_id: String,
    /// Description.
    pub description: String,
    /// Pattern events must match.
    pub pattern: EventPattern,
    /// Whether the rule is enabled.
    pub enabled: bool,
}

impl EventRuleSpec {
    /// Logical ID of the invoke permission created for `target`.
    #[must_use]
    pub fn permission_id(&self, target: &FunctionRef) -> String {
        format!("{}Allow{}", self.logical_id, target.logical_id)
    }

    /// Lowers the rule and the permission that lets it invoke `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if builder validation fails.
    pub fn add_to(&self, builder: &mut StackBuilder, target: &FunctionRef) -> SynthResult<Expr> {
        builder.add_resource(
            &self.logical_id,
            Resource::new(types::EVENTS_RULE)
                .with_property("Description", self.description.as_str())
                .with_property("EventPattern", Expr::Json(self.pattern.to_value()))
                .with_property("State", if self.enabled { "ENABLED" } else { "DISABLED" })
                .with_property(
                    "Targets",
                    Expr::list([Expr::map([("Arn", target.arn()), ("Id", Expr::from("Target0"))])]),
                ),
        )?;
        let rule_arn = Expr::get_att(&self.logical_id, "Arn");
        target.grant_invoke(
            builder,
            &self.permission_id(target),
            ServicePrincipal::Events,
            rule_arn.clone(),
            None,
        )?;
        Ok(rule_arn)
    }
}
