//! End-to-end scenarios through the public `FlowEngine` API.

use flownet_core::chain::{ConversionChain, ExecutionState, StepState};
use flownet_core::config::EngineConfig;
use flownet_core::converter::{ConversionError, ErrorCategory, ProcessState};
use flownet_core::engine::FlowEngine;
use flownet_core::event::{Event, EventKind, ListenerPriority};
use flownet_core::fixed::Fixed64;
use flownet_core::graph::{ConverterConfig, FlowNode, GraphError, NodeKind};
use flownet_core::history::TransferOrigin;
use flownet_core::id::*;
use flownet_core::resource::ResourceState;
use flownet_core::tech::UnlockedTechnologies;
use flownet_core::test_utils::*;
use std::sync::{Arc, Mutex};

fn manual_engine() -> FlowEngine {
    FlowEngine::new(EngineConfig {
        auto_fill_converters: false,
        ..deterministic_config()
    })
    .unwrap()
}

fn rate(engine: &FlowEngine, connection: &str) -> Fixed64 {
    engine.get_connection(connection).unwrap().current_rate
}

fn stock(engine: &FlowEngine, node: &str, resource: &str) -> Fixed64 {
    engine
        .get_node(node)
        .and_then(|n| n.resource(resource))
        .map(|s| s.current)
        .unwrap_or(Fixed64::ZERO)
}

// ===========================================================================
// Optimizer scenarios
// ===========================================================================

/// Ample supply: the rate is capped by the connection's max rate.
#[test]
fn scenario_a_rate_capped_by_max_rate() {
    let mut engine = manual_engine();
    engine.register_node(producer("P", minerals(), 1000.0, 2000.0, 0.0)).unwrap();
    engine.register_node(consumer("C", minerals(), 1000.0, 100.0)).unwrap();
    engine
        .register_connection(link("P->C", "P", "C", minerals(), 50.0).with_priority(1))
        .unwrap();

    let result = engine.optimize_flows();

    assert_eq!(rate(&engine, "P->C"), fixed(50.0));
    assert_eq!(result.transfers.len(), 1);
    assert_eq!(result.transfers[0].amount, fixed(50.0));
    assert_eq!(result.transfers[0].origin, TransferOrigin::Optimized);
    assert_eq!(engine.transfer_history().len(), 1);
    // The optimizer only sets rates; stocks are untouched.
    assert_eq!(stock(&engine, "P", "minerals"), fixed(1000.0));
}

/// Scarce supply: the rate is rationed by availability over demand.
#[test]
fn scenario_b_rate_rationed_by_scarcity() {
    let mut engine = manual_engine();
    engine.register_node(producer("P", minerals(), 40.0, 100.0, 0.0)).unwrap();
    engine.register_node(consumer("C", minerals(), 1000.0, 100.0)).unwrap();
    engine
        .register_connection(link("P->C", "P", "C", minerals(), 100.0))
        .unwrap();

    let result = engine.optimize_flows();

    assert_eq!(rate(&engine, "P->C"), fixed(40.0));
    assert_eq!(result.bottlenecks, vec![minerals()]);
    assert_eq!(result.metrics.transfers_generated, 1);
}

#[test]
fn inactive_connection_is_zeroed() {
    let mut engine = manual_engine();
    engine.register_node(producer("P", minerals(), 100.0, 100.0, 0.0)).unwrap();
    engine.register_node(consumer("C", minerals(), 100.0, 10.0)).unwrap();
    engine.register_connection(link("P->C", "P", "C", minerals(), 50.0)).unwrap();
    engine.optimize_flows();
    assert_eq!(rate(&engine, "P->C"), fixed(10.0));

    engine.set_connection_active("P->C", false).unwrap();
    let result = engine.optimize_flows();
    assert_eq!(rate(&engine, "P->C"), Fixed64::ZERO);
    assert!(result.transfers.is_empty());
}

#[test]
fn offloaded_balancing_matches_local() {
    let build = |offload: bool| {
        let mut engine = FlowEngine::new(EngineConfig {
            offload_enabled: offload,
            batch_size: 1,
            offload_timeout_ms: 5_000,
            ..deterministic_config()
        })
        .unwrap();
        engine.register_node(producer("P", ore(), 70.0, 100.0, 5.0)).unwrap();
        engine.register_node(consumer("A", ore(), 100.0, 60.0)).unwrap();
        engine.register_node(consumer("B", ore(), 100.0, 40.0)).unwrap();
        engine
            .register_connection(link("P->A", "P", "A", ore(), 100.0).with_priority(2))
            .unwrap();
        engine
            .register_connection(link("P->B", "P", "B", ore(), 100.0).with_priority(1))
            .unwrap();
        engine
    };

    let mut local = build(false);
    let mut offloaded = build(true);
    let local_result = local.optimize_flows();
    let offloaded_result = offloaded.optimize_flows();

    assert!(!local_result.metrics.offloaded);
    assert!(offloaded_result.metrics.offloaded);
    assert_eq!(offloaded.offload_fallbacks(), 0);
    assert_eq!(local_result.transfers, offloaded_result.transfers);
    assert_eq!(rate(&local, "P->A"), fixed(60.0));
    assert_eq!(rate(&offloaded, "P->B"), fixed(15.0));
}

// ===========================================================================
// Conversion scenarios
// ===========================================================================

/// Insufficient inputs: the start fails and nothing is consumed.
#[test]
fn scenario_c_insufficient_inputs_leaves_pool_unchanged() {
    let mut engine = manual_engine();
    engine
        .register_node(converter("smelter", &[(ore(), 5.0)], 100.0))
        .unwrap();
    engine
        .register_recipe(recipe("smelt", 1000, &[(ore(), 10.0)], &[(metal(), 1.0)]))
        .unwrap();

    let err = engine.start_process("smelter", "smelt").unwrap_err();
    assert!(matches!(err, ConversionError::InsufficientInputs { .. }));
    assert_eq!(err.category(), ErrorCategory::Capacity);
    assert_eq!(stock(&engine, "smelter", "ore"), fixed(5.0));
    assert!(engine.active_processes().is_empty());
}

#[test]
fn process_completes_after_duration_over_efficiency() {
    let mut engine = manual_engine();
    engine
        .register_node(converter("smelter", &[(ore(), 50.0)], 100.0))
        .unwrap();
    engine
        .register_recipe(recipe("smelt", 1100, &[(ore(), 10.0)], &[(metal(), 2.0)]))
        .unwrap();

    let id = engine.start_process("smelter", "smelt").unwrap();
    // An idle converter gets the low-stress bonus.
    let efficiency = engine.process(id).unwrap().efficiency;
    assert_eq!(efficiency, Fixed64::lit("1.1"));
    assert_eq!(stock(&engine, "smelter", "ore"), fixed(40.0));

    assert_eq!(engine.process_tick(999), 0);
    assert_eq!(stock(&engine, "smelter", "metal"), Fixed64::ZERO);

    assert_eq!(engine.process_tick(1), 1);
    assert!(approx(stock(&engine, "smelter", "metal"), fixed(2.2)));
    let process = engine.process(id).unwrap();
    assert_eq!(process.state, ProcessState::Completed);
    assert_eq!(process.progress, Fixed64::ONE);
    assert_eq!(engine.completed_processes().len(), 1);
}

#[test]
fn paused_process_does_not_progress() {
    let mut engine = manual_engine();
    engine
        .register_node(converter("smelter", &[(ore(), 50.0)], 100.0))
        .unwrap();
    engine
        .register_recipe(recipe("smelt", 1000, &[(ore(), 10.0)], &[(metal(), 1.0)]))
        .unwrap();

    let id = engine.start_process("smelter", "smelt").unwrap();
    assert!(engine.pause_process(id));
    assert_eq!(engine.process_tick(5000), 0);
    assert_eq!(engine.process(id).unwrap().progress, Fixed64::ZERO);

    assert!(engine.resume_process(id));
    assert_eq!(engine.process_tick(1000), 1);
}

#[test]
fn cancelled_process_is_not_refunded() {
    let mut engine = manual_engine();
    engine
        .register_node(converter("smelter", &[(ore(), 50.0)], 100.0))
        .unwrap();
    engine
        .register_recipe(recipe("smelt", 1000, &[(ore(), 10.0)], &[(metal(), 1.0)]))
        .unwrap();

    let id = engine.start_process("smelter", "smelt").unwrap();
    assert!(engine.cancel_process(id));
    assert!(!engine.cancel_process(id));
    assert_eq!(engine.process(id).unwrap().state, ProcessState::Cancelled);
    assert_eq!(stock(&engine, "smelter", "ore"), fixed(40.0));
    assert_eq!(engine.process_tick(2000), 0);
}

#[test]
fn locked_technology_blocks_start() {
    let mut engine = manual_engine();
    engine
        .register_node(converter("lab", &[(ore(), 50.0)], 100.0))
        .unwrap();
    engine
        .register_recipe(recipe("refine", 1000, &[(ore(), 1.0)], &[(metal(), 1.0)]).requiring("metallurgy"))
        .unwrap();

    engine.set_technology_gate(UnlockedTechnologies::new());
    let err = engine.start_process("lab", "refine").unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Prerequisite);
    assert!(err.to_string().contains("metallurgy"));

    engine.set_technology_gate([TechId::from("metallurgy")].into_iter().collect::<UnlockedTechnologies>());
    assert!(engine.start_process("lab", "refine").is_ok());
}

#[test]
fn conversion_rate_recipe_is_replaced_not_duplicated() {
    let mut engine = manual_engine();
    let first = engine.set_conversion_rate(&ore(), &metal(), fixed(2.0)).unwrap();
    let second = engine.set_conversion_rate(&ore(), &metal(), fixed(3.0)).unwrap();
    assert_eq!(first, second);
    assert_eq!(engine.all_conversion_recipes().len(), 1);
    assert_eq!(engine.recipe(first.as_str()).unwrap().outputs[0].amount, fixed(3.0));
}

#[test]
fn idle_converters_are_filled_before_optimizing() {
    let mut engine = test_engine();
    engine
        .register_node(converter("smelter", &[(ore(), 50.0)], 100.0))
        .unwrap();
    engine
        .register_recipe(recipe("smelt", 1000, &[(ore(), 10.0)], &[(metal(), 1.0)]))
        .unwrap();

    let result = engine.optimize_flows();
    assert_eq!(result.metrics.converters_started, 1);
    assert_eq!(engine.active_processes().len(), 1);
}

// ===========================================================================
// Chains
// ===========================================================================

fn chain_fixture() -> FlowEngine {
    let mut engine = manual_engine();
    engine
        .register_node(
            FlowNode::new("smelter", NodeKind::Converter)
                .with_resource(ore(), ResourceState::stocked(fixed(100.0), fixed(1000.0)))
                .with_converter(ConverterConfig::default().supporting([RecipeId::from("smelt")])),
        )
        .unwrap();
    engine
        .register_node(
            FlowNode::new("forge", NodeKind::Converter)
                .with_resource(metal(), ResourceState::stocked(fixed(100.0), fixed(1000.0)))
                .with_converter(ConverterConfig::default().supporting([RecipeId::from("forge")])),
        )
        .unwrap();
    engine
        .register_recipe(recipe("smelt", 1000, &[(ore(), 10.0)], &[(metal(), 1.0)]))
        .unwrap();
    engine
        .register_recipe(recipe("forge", 10_000, &[(metal(), 1.0)], &[(alloy(), 1.0)]))
        .unwrap();
    engine
        .register_chain(ConversionChain::new(
            "alloy-line",
            [RecipeId::from("smelt"), RecipeId::from("forge")],
        ))
        .unwrap();
    engine
}

/// A busy converter leaves the next step queued, never failed, until a
/// slot frees up.
#[test]
fn scenario_d_busy_converter_keeps_step_queued() {
    let mut engine = chain_fixture();
    engine.start_process("forge", "forge").unwrap();
    let exec = engine.start_chain("alloy-line", None).unwrap();

    engine.advance(5000);
    let execution = engine.chain_execution(exec).unwrap();
    assert_eq!(execution.steps[0].state, StepState::Completed);
    assert_eq!(execution.steps[1].state, StepState::Queued);
    assert!(execution.steps[1].attempts > 0);
    assert_eq!(execution.state, ExecutionState::Active);

    // The forge's own process finishes at 10 000; the step starts on that tick.
    engine.advance(5000);
    let execution = engine.chain_execution(exec).unwrap();
    assert_eq!(execution.steps[1].state, StepState::InProgress);
    assert_eq!(execution.steps[1].converter, Some(NodeId::from("forge")));

    engine.advance(10_000);
    let execution = engine.chain_execution(exec).unwrap();
    assert!(execution.is_completed());
    assert_eq!(execution.progress, Fixed64::ONE);
}

#[test]
fn chain_completion_and_failure_are_published() {
    let mut engine = chain_fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in [EventKind::ChainCompleted, EventKind::ChainFailed] {
        let sink = seen.clone();
        engine.subscribe(kind, Box::new(move |e| sink.lock().unwrap().push(e.kind())));
    }

    let good = engine.start_chain("alloy-line", None).unwrap();
    engine
        .register_chain(ConversionChain::new("broken", [RecipeId::from("missing")]))
        .unwrap();
    let bad = engine.start_chain("broken", None).unwrap();
    assert!(engine.chain_execution(bad).unwrap().is_failed());

    engine.advance(20_000);
    assert!(engine.chain_execution(good).unwrap().is_completed());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.contains(&EventKind::ChainFailed));
    assert!(seen.contains(&EventKind::ChainCompleted));
}

#[test]
fn unknown_initial_converter_is_rejected() {
    let mut engine = chain_fixture();
    assert!(engine.start_chain("alloy-line", Some("nowhere")).is_err());
    assert_eq!(engine.chain_executions().count(), 0);
}

#[test]
fn cancelled_chain_cancels_its_process() {
    let mut engine = chain_fixture();
    let exec = engine.start_chain("alloy-line", None).unwrap();
    let process = engine.chain_execution(exec).unwrap().steps[0].process.unwrap();

    assert!(engine.cancel_chain(exec).unwrap());
    assert!(engine.chain_execution(exec).unwrap().is_failed());
    assert_eq!(engine.process(process).unwrap().state, ProcessState::Cancelled);
    assert!(!engine.cancel_chain(exec).unwrap());
}

// ===========================================================================
// Graph lifecycle
// ===========================================================================

#[test]
fn node_with_empty_resources_is_rejected() {
    let mut engine = manual_engine();
    let err = engine.register_node(FlowNode::new("empty", NodeKind::Storage)).unwrap_err();
    assert!(matches!(err, GraphError::EmptyResources(_)));
    assert_eq!(engine.graph().node_count(), 0);
}

#[test]
fn connection_to_missing_node_is_rejected() {
    let mut engine = manual_engine();
    engine.register_node(producer("P", ore(), 10.0, 10.0, 0.0)).unwrap();
    let err = engine
        .register_connection(link("P->X", "P", "X", ore(), 5.0))
        .unwrap_err();
    assert!(matches!(err, GraphError::EndpointMissing { .. }));
    assert_eq!(engine.graph().connection_count(), 0);
}

#[test]
fn unregistering_node_cascades_to_connections() {
    let mut engine = manual_engine();
    let removed = Arc::new(Mutex::new(Vec::new()));
    let sink = removed.clone();
    engine.subscribe(
        EventKind::NodeUnregistered,
        Box::new(move |e| {
            if let Event::NodeUnregistered { removed_connections, .. } = e {
                sink.lock().unwrap().extend(removed_connections.iter().cloned());
            }
        }),
    );

    engine.register_node(storage("hub", ore(), 10.0, 100.0)).unwrap();
    engine.register_node(producer("P", ore(), 10.0, 100.0, 0.0)).unwrap();
    engine.register_node(consumer("C", ore(), 100.0, 1.0)).unwrap();
    engine.register_connection(link("P->hub", "P", "hub", ore(), 5.0)).unwrap();
    engine.register_connection(link("hub->C", "hub", "C", ore(), 5.0)).unwrap();
    engine.register_connection(link("P->C", "P", "C", ore(), 5.0)).unwrap();

    let gone = engine.unregister_node("hub").unwrap();
    assert_eq!(gone.connections.len(), 2);
    assert!(engine.get_node("hub").is_none());
    assert_eq!(engine.graph().connection_count(), 1);
    assert!(engine.node_connections("hub").is_empty());
    assert_eq!(engine.node_connections("P").len(), 1);

    engine.deliver_events();
    assert_eq!(
        *removed.lock().unwrap(),
        vec![ConnectionId::from("P->hub"), ConnectionId::from("hub->C")]
    );
}

#[test]
fn inactive_node_is_left_out_of_aggregates() {
    let mut engine = manual_engine();
    engine.register_node(storage("a", ore(), 10.0, 100.0)).unwrap();
    engine.register_node(storage("b", ore(), 5.0, 100.0)).unwrap();
    assert_eq!(engine.resource_state(&ore()).unwrap().current, fixed(15.0));

    engine.set_node_active("b", false).unwrap();
    assert_eq!(engine.resource_state(&ore()).unwrap().current, fixed(10.0));
    assert!(engine.cache_stats().invalidations > 0);
}

// ===========================================================================
// Events
// ===========================================================================

#[test]
fn listeners_run_by_priority_then_subscription_order() {
    let mut engine = manual_engine();
    let order = Arc::new(Mutex::new(Vec::new()));
    for (label, priority) in [
        ("normal-1", ListenerPriority::Normal),
        ("post", ListenerPriority::Post),
        ("pre", ListenerPriority::Pre),
        ("normal-2", ListenerPriority::Normal),
    ] {
        let sink = order.clone();
        engine.subscribe_filtered(
            EventKind::NodeRegistered,
            priority,
            None,
            Box::new(move |_| sink.lock().unwrap().push(label)),
        );
    }

    engine.register_node(storage("s", ore(), 1.0, 10.0)).unwrap();
    engine.deliver_events();
    assert_eq!(*order.lock().unwrap(), vec!["pre", "normal-1", "normal-2", "post"]);
}

#[test]
fn bulk_registration_delivers_every_event() {
    let mut engine = manual_engine();
    let capacity = engine.config().event_buffer_capacity;
    let count = Arc::new(Mutex::new(0usize));
    let sink = count.clone();
    engine.subscribe(
        EventKind::NodeRegistered,
        Box::new(move |_| *sink.lock().unwrap() += 1),
    );

    let total = capacity + 76;
    for i in 0..total {
        engine
            .register_node(storage(&format!("s{i}"), ore(), 1.0, 10.0))
            .unwrap();
    }
    let result = engine.advance(1);
    assert_eq!(*count.lock().unwrap(), total);
    assert!(result.events_delivered >= total);
}

#[test]
fn suppressed_events_are_not_buffered() {
    let mut engine = manual_engine();
    engine.suppress_event(EventKind::ResourceUpdated);
    engine.register_node(storage("s", ore(), 1.0, 10.0)).unwrap();
    engine.add_resources("s", &ore(), fixed(1.0)).unwrap();
    assert_eq!(engine.event_bus().buffered_count(EventKind::ResourceUpdated), 0);
    assert_eq!(engine.event_bus().buffered_count(EventKind::NodeRegistered), 1);
}

#[test]
fn events_are_delivered_at_end_of_advance() {
    let mut engine = manual_engine();
    let count = Arc::new(Mutex::new(0usize));
    let sink = count.clone();
    engine.subscribe(
        EventKind::OptimizationCompleted,
        Box::new(move |_| *sink.lock().unwrap() += 1),
    );

    engine.optimize_flows();
    assert_eq!(*count.lock().unwrap(), 0);
    let result = engine.advance(1);
    assert_eq!(result.events_delivered, 1);
    assert_eq!(*count.lock().unwrap(), 1);
}
