//! Branching scenarios: typed predicates and value dispatch

use runloom::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Customer {
    name: String,
    tier: String,
}

fn tier_graph() -> runloom::Graph {
    GraphBuilder::new("tiering", "1.0")
        .start_with(StepDefinition::value("ingest", |c: Customer, _ctx| async move {
            Ok(c)
        }))
        .choose("tier", |c: &Customer| c.tier.clone())
        .when(
            "gold".to_string(),
            Flow::start(StepDefinition::of("gold-lane", |c: Customer, _ctx| async move {
                StepResult::finish(format!("VIP-gold:{}", c.name)).map_err(Into::into)
            })),
        )
        .when(
            "silver".to_string(),
            Flow::start(StepDefinition::of("silver-lane", |_: Customer, _ctx| async move {
                StepResult::finish("VIP-silver".to_string()).map_err(Into::into)
            })),
        )
        .otherwise(Flow::start(StepDefinition::of(
            "standard-lane",
            |_: Customer, _ctx| async move {
                StepResult::finish("std".to_string()).map_err(Into::into)
            },
        )))
        .returning::<String>()
        .build()
        .expect("graph should build")
}

#[tokio::test]
async fn value_dispatch_routes_matching_value() {
    let engine = WorkflowEngine::new();
    engine.register(tier_graph()).unwrap();

    let execution = engine
        .execute::<Customer, String>(
            "tiering",
            Customer {
                name: "Ada".to_string(),
                tier: "silver".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(execution.result().await.unwrap(), "VIP-silver");
}

#[tokio::test]
async fn value_dispatch_falls_through_to_otherwise() {
    let engine = WorkflowEngine::new();
    engine.register(tier_graph()).unwrap();

    let execution = engine
        .execute::<Customer, String>(
            "tiering",
            Customer {
                name: "Bea".to_string(),
                tier: "bronze".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(execution.result().await.unwrap(), "std");
}

#[tokio::test]
async fn branch_marker_is_not_stored_as_step_output() {
    let engine = WorkflowEngine::new();
    engine.register(tier_graph()).unwrap();

    let execution = engine
        .execute::<Customer, String>(
            "tiering",
            Customer {
                name: "Cy".to_string(),
                tier: "gold".to_string(),
            },
        )
        .await
        .unwrap();
    let instance_id = execution.instance_id().to_string();
    assert_eq!(execution.result().await.unwrap(), "VIP-gold:Cy");

    let instance = engine.instance(&instance_id).await.unwrap().unwrap();
    // the decision ran (it is in the history) but left nothing in the data flow
    assert!(instance.history.iter().any(|r| r.step_id == "tier"));
    assert!(instance.context.output("tier").is_none());
}

#[tokio::test]
async fn predicate_branch_routes_both_arms() {
    let graph = GraphBuilder::new("sizing", "1.0")
        .start_with(StepDefinition::value("start", |n: i64, _ctx| async move { Ok(n) }))
        .branch(
            "big-enough",
            |n: &i64| *n > 10,
            Flow::start(StepDefinition::of("big", |n: i64, _ctx| async move {
                StepResult::finish(format!("big:{n}")).map_err(Into::into)
            })),
            Flow::start(StepDefinition::of("small", |n: i64, _ctx| async move {
                StepResult::finish(format!("small:{n}")).map_err(Into::into)
            })),
        )
        .returning::<String>()
        .build()
        .unwrap();

    let engine = WorkflowEngine::new();
    engine.register(graph).unwrap();

    let execution = engine.execute::<i64, String>("sizing", 25).await.unwrap();
    assert_eq!(execution.result().await.unwrap(), "big:25");

    let execution = engine.execute::<i64, String>("sizing", 3).await.unwrap();
    assert_eq!(execution.result().await.unwrap(), "small:3");
}

#[tokio::test]
async fn branch_arms_receive_the_pre_decision_output() {
    // multi-step arm: the arm's second step consumes the first's output
    let graph = GraphBuilder::new("pipeline", "1.0")
        .start_with(StepDefinition::value("start", |n: i64, _ctx| async move { Ok(n) }))
        .branch(
            "check",
            |n: &i64| *n % 2 == 0,
            Flow::start(StepDefinition::value("halve", |n: i64, _ctx| async move {
                Ok(n / 2)
            }))
            .then(StepDefinition::of("report-even", |n: i64, _ctx| async move {
                StepResult::finish(format!("even-half:{n}")).map_err(Into::into)
            })),
            Flow::start(StepDefinition::of("report-odd", |n: i64, _ctx| async move {
                StepResult::finish(format!("odd:{n}")).map_err(Into::into)
            })),
        )
        .returning::<String>()
        .build()
        .unwrap();

    let engine = WorkflowEngine::new();
    engine.register(graph).unwrap();

    let execution = engine.execute::<i64, String>("pipeline", 8).await.unwrap();
    assert_eq!(execution.result().await.unwrap(), "even-half:4");
}

#[tokio::test]
async fn parallel_join_forwards_through_the_fan_out() {
    let graph = GraphBuilder::new("fanout", "1.0")
        .start_with(StepDefinition::value("start", |n: i64, _ctx| async move { Ok(n) }))
        .parallel(vec![
            StepDefinition::value("enrich-a", |n: i64, _ctx| async move { Ok(n + 1) }),
            StepDefinition::value("enrich-b", |n: i64, _ctx| async move { Ok(n + 100) }),
        ])
        .then(StepDefinition::of("finish", |v: serde_json::Value, _ctx| async move {
            StepResult::finish(v.to_string()).map_err(Into::into)
        }))
        .returning::<String>()
        .build()
        .unwrap();

    let engine = WorkflowEngine::new();
    engine.register(graph).unwrap();

    // the router picks the first type-compatible fan-out member; the join
    // forwards whatever reaches it
    let execution = engine.execute::<i64, String>("fanout", 1).await.unwrap();
    assert_eq!(execution.result().await.unwrap(), "2");
}
