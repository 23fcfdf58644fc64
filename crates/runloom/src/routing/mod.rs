//! Step routing and input preparation
//!
//! Routing answers "which step runs next" from the edges and type tokens;
//! input preparation answers "what does it receive", resolving from the
//! trigger, a pending resumption value, or prior outputs.

use std::collections::HashSet;

use crate::graph::{Edge, Graph, StepNode};
use crate::state::{BranchEvent, StepOutput, TypeToken, WorkflowInstance, USER_INPUT_KEY};

/// First sequential successor of `from_step_id` whose target accepts `data`
///
/// Outgoing sequential edges are tried in declaration order. Data with no
/// recorded type only matches targets declaring the dynamic-value input.
pub fn find_next_step<'g>(
    graph: &'g Graph,
    from_step_id: &str,
    data: &StepOutput,
) -> Option<&'g StepNode> {
    for edge in graph.edges_from(from_step_id) {
        if let Edge::Sequential { to, .. } = edge {
            let target = graph.node(to)?;
            let acceptable = match data.type_token() {
                Some(token) => target.accepts(token),
                None => target.input().is_value(),
            };
            if acceptable {
                return Some(target);
            }
        }
    }
    None
}

/// Branch edge target selected by a routing event
///
/// Only branch edges are considered. Value edges need both the marker type
/// and value to match and are more specific than type-only edges;
/// declaration order breaks ties within each class.
pub fn find_branch_target<'g>(
    graph: &'g Graph,
    from_step_id: &str,
    event: &BranchEvent,
) -> Option<&'g StepNode> {
    let edges = graph.edges_from(from_step_id);

    for edge in edges {
        if let Edge::BranchOnValue {
            to, marker, value, ..
        } = edge
        {
            if marker == event.marker() && Some(value) == event.value() {
                return graph.node(to);
            }
        }
    }

    for edge in edges {
        if let Edge::BranchOnType { to, marker, .. } = edge {
            if marker == event.marker() {
                return graph.node(to);
            }
        }
    }

    None
}

/// First step (excluding `exclude_step_id`) whose declared input accepts
/// the given type, scanning nodes in declaration order
pub fn find_step_for_input_type<'g>(
    graph: &'g Graph,
    token: &TypeToken,
    exclude_step_id: &str,
) -> Option<&'g StepNode> {
    graph
        .nodes()
        .find(|node| node.id() != exclude_step_id && node.accepts(token))
}

/// Assemble the input for a step execution
///
/// Resolution priorities, higher first:
///
/// 1. Initial step on a fresh run: the trigger data.
/// 2. A pending resumption value the step can accept (by token, or by the
///    cast probe when the recorded type is incompatible); consumed here.
/// 3. The most recent type-compatible prior output, walking the execution
///    history newest-first: one pass preferring exact token matches, then
///    one accepting assignable matches.
/// 4. Initial steps only: the trigger data when type-compatible.
/// 5. Otherwise unresolved: the executor still runs the step, which fails
///    with a type error.
pub fn prepare_input(instance: &mut WorkflowInstance, step: &StepNode) -> Option<StepOutput> {
    if step.is_initial() && !instance.context.has_outputs() {
        return Some(instance.context.trigger_data().clone());
    }

    if let Some(pending) = instance.context.output(USER_INPUT_KEY) {
        let acceptable = instance
            .context
            .user_input_token()
            .map(|token| step.accepts(&token))
            .unwrap_or(false);
        let castable = !acceptable && step.probe_input(pending);
        if acceptable || castable {
            let (value, _) = instance.context.take_user_input()?;
            return Some(value);
        }
    }

    // newest-first walk over distinct executed steps
    let mut seen = HashSet::new();
    let mut recent: Vec<&str> = Vec::new();
    for record in instance.history.iter().rev() {
        if seen.insert(record.step_id.as_str()) {
            recent.push(record.step_id.as_str());
        }
    }

    for step_id in &recent {
        if let Some(output) = instance.context.output(step_id) {
            if output.type_token() == Some(step.input()) {
                return Some(output.clone());
            }
        }
    }
    for step_id in &recent {
        if let Some(output) = instance.context.output(step_id) {
            if output.is_compatible_with(step.input()) {
                return Some(output.clone());
            }
        }
    }

    if step.is_initial() && instance.context.trigger_data().is_compatible_with(step.input()) {
        return Some(instance.context.trigger_data().clone());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Flow, GraphBuilder, StepDefinition};
    use crate::state::{
        ExecutionRecord, StepResult, WorkflowContext,
    };
    use chrono::Utc;

    fn int_step(id: &str) -> StepDefinition {
        StepDefinition::value(id, |n: i64, _ctx| async move { Ok(n) })
    }

    fn string_step(id: &str) -> StepDefinition {
        StepDefinition::value(id, |s: String, _ctx| async move { Ok(s) })
    }

    fn finish_step(id: &str) -> StepDefinition {
        StepDefinition::of(id, |s: String, _ctx| async move {
            StepResult::finish(s).map_err(Into::into)
        })
    }

    fn instance_for(graph: &Graph, trigger: StepOutput) -> WorkflowInstance {
        let ctx = WorkflowContext::new("run-1", trigger);
        WorkflowInstance::new(graph.id(), graph.version(), ctx, graph.initial_step_id())
    }

    fn record(step_id: &str) -> ExecutionRecord {
        ExecutionRecord {
            step_id: step_id.to_string(),
            input: None,
            output: None,
            duration_ms: 0,
            success: true,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_find_next_step_honors_types() {
        let graph = GraphBuilder::new("wf", "1.0")
            .start_with(int_step("a"))
            .then(string_step("b"))
            .build()
            .unwrap();

        // an i64 payload cannot enter the String-typed successor
        let data = StepOutput::of(&1i64).unwrap();
        assert!(find_next_step(&graph, "a", &data).is_none());

        let data = StepOutput::of(&"x".to_string()).unwrap();
        assert_eq!(find_next_step(&graph, "a", &data).unwrap().id(), "b");
    }

    #[test]
    fn test_find_next_step_declaration_order() {
        // two i64-typed successors of "a"; the first declared edge wins
        let graph = GraphBuilder::new("wf", "1.0")
            .start_with(int_step("a"))
            .parallel(vec![int_step("first"), int_step("second")])
            .build()
            .unwrap();

        let data = StepOutput::of(&1i64).unwrap();
        assert_eq!(find_next_step(&graph, "a", &data).unwrap().id(), "first");
    }

    #[test]
    fn test_branch_target_value_beats_type() {
        let graph = GraphBuilder::new("wf", "1.0")
            .start_with(int_step("start"))
            .choose("tier", |n: &i64| {
                if *n > 10 { "gold".to_string() } else { "other".to_string() }
            })
            .when("gold".to_string(), Flow::start(finish_step("gold-lane")))
            .otherwise(Flow::start(finish_step("std-lane")))
            .build()
            .unwrap();

        let gold = BranchEvent::with_value(&"gold".to_string()).unwrap();
        assert_eq!(find_branch_target(&graph, "tier", &gold).unwrap().id(), "gold-lane");

        // unmatched value falls through to the type-only otherwise edge
        let bronze = BranchEvent::with_value(&"bronze".to_string()).unwrap();
        assert_eq!(find_branch_target(&graph, "tier", &bronze).unwrap().id(), "std-lane");

        // a different marker type matches nothing
        let wrong = BranchEvent::with_value(&42i64).unwrap();
        assert!(find_branch_target(&graph, "tier", &wrong).is_none());
    }

    #[test]
    fn test_find_step_for_input_type_excludes() {
        let graph = GraphBuilder::new("wf", "1.0")
            .start_with(string_step("ask"))
            .then(string_step("greet"))
            .build()
            .unwrap();

        let token = TypeToken::of::<String>();
        let found = find_step_for_input_type(&graph, &token, "ask").unwrap();
        assert_eq!(found.id(), "greet");

        assert!(find_step_for_input_type(&graph, &TypeToken::of::<u8>(), "ask").is_none());
    }

    #[test]
    fn test_prepare_input_initial_gets_trigger() {
        let graph = GraphBuilder::new("wf", "1.0")
            .start_with(int_step("a"))
            .build()
            .unwrap();
        let mut instance = instance_for(&graph, StepOutput::of(&7i64).unwrap());

        let input = prepare_input(&mut instance, graph.node("a").unwrap()).unwrap();
        assert_eq!(input.value::<i64>().unwrap(), 7);
    }

    #[test]
    fn test_prepare_input_consumes_user_input() {
        let graph = GraphBuilder::new("wf", "1.0")
            .start_with(string_step("ask"))
            .then(string_step("greet"))
            .build()
            .unwrap();
        let mut instance = instance_for(&graph, StepOutput::of(&"hi".to_string()).unwrap());
        instance.context.set_output("ask", StepOutput::of(&"prompt".to_string()).unwrap());
        instance
            .context
            .set_user_input(
                StepOutput::of(&"Alice".to_string()).unwrap(),
                &TypeToken::of::<String>(),
            )
            .unwrap();

        let input = prepare_input(&mut instance, graph.node("greet").unwrap()).unwrap();
        assert_eq!(input.value::<String>().unwrap(), "Alice");
        assert!(instance.context.output(USER_INPUT_KEY).is_none());
    }

    #[test]
    fn test_prepare_input_user_input_left_for_compatible_step() {
        // a step that cannot accept the pending input leaves it in place
        let graph = GraphBuilder::new("wf", "1.0")
            .start_with(string_step("ask"))
            .then(int_step("count"))
            .build()
            .unwrap();
        let mut instance = instance_for(&graph, StepOutput::of(&"hi".to_string()).unwrap());
        instance.context.set_output("ask", StepOutput::of(&"prompt".to_string()).unwrap());
        instance
            .context
            .set_user_input(
                StepOutput::of(&"Alice".to_string()).unwrap(),
                &TypeToken::of::<String>(),
            )
            .unwrap();
        instance.history.push(record("ask"));

        let input = prepare_input(&mut instance, graph.node("count").unwrap());
        assert!(input.is_none());
        assert!(instance.context.output(USER_INPUT_KEY).is_some());
    }

    #[test]
    fn test_prepare_input_walks_history_newest_first() {
        let graph = GraphBuilder::new("wf", "1.0")
            .start_with(int_step("a"))
            .then(int_step("b"))
            .then(int_step("c"))
            .build()
            .unwrap();
        let mut instance = instance_for(&graph, StepOutput::of(&0i64).unwrap());

        instance.context.set_output("a", StepOutput::of(&1i64).unwrap());
        instance.history.push(record("a"));
        instance.context.set_output("b", StepOutput::of(&2i64).unwrap());
        instance.history.push(record("b"));

        let input = prepare_input(&mut instance, graph.node("c").unwrap()).unwrap();
        assert_eq!(input.value::<i64>().unwrap(), 2);
    }

    #[test]
    fn test_prepare_input_prefers_exact_over_assignable() {
        let graph = GraphBuilder::new("wf", "1.0")
            .start_with(int_step("a"))
            .then(StepDefinition::value("dyn", |v: serde_json::Value, _ctx| async move { Ok(v) }))
            .then(int_step("c"))
            .build()
            .unwrap();
        let mut instance = instance_for(&graph, StepOutput::of(&0i64).unwrap());

        // newest output is a dynamic value; an older one matches i64 exactly
        instance.context.set_output("a", StepOutput::of(&1i64).unwrap());
        instance.history.push(record("a"));
        instance
            .context
            .set_output("dyn", StepOutput::of(&serde_json::json!({"k": 1})).unwrap());
        instance.history.push(record("dyn"));

        let input = prepare_input(&mut instance, graph.node("c").unwrap()).unwrap();
        assert_eq!(input.value::<i64>().unwrap(), 1);
    }

    #[test]
    fn test_prepare_input_non_initial_never_sees_trigger() {
        let graph = GraphBuilder::new("wf", "1.0")
            .start_with(int_step("a"))
            .then(int_step("b"))
            .build()
            .unwrap();
        let mut instance = instance_for(&graph, StepOutput::of(&9i64).unwrap());

        // history exists but holds nothing compatible
        instance
            .context
            .set_output("a", StepOutput::of(&"text".to_string()).unwrap());
        instance.history.push(record("a"));

        assert!(prepare_input(&mut instance, graph.node("b").unwrap()).is_none());
    }

    #[test]
    fn test_prepare_input_initial_trigger_fallback_is_type_guarded() {
        let graph = GraphBuilder::new("wf", "1.0")
            .start_with(int_step("a"))
            .then(int_step("b"))
            .build()
            .unwrap();
        let mut instance = instance_for(&graph, StepOutput::of(&9i64).unwrap());

        // a re-entered initial step with incompatible history falls back to
        // the trigger because the types line up
        instance
            .context
            .set_output("b", StepOutput::of(&"text".to_string()).unwrap());
        instance.history.push(record("b"));

        let input = prepare_input(&mut instance, graph.node("a").unwrap()).unwrap();
        assert_eq!(input.value::<i64>().unwrap(), 9);
    }
}
