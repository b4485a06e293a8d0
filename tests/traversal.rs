mod common;

use std::sync::Arc;

use common::{drive, first_output, tags, text_kit, values};
use flowboard::graph::{Edge, GraphDescriptor, NodeDescriptor, OutputValues};
use flowboard::run::LocalRunner;
use flowboard::traversal::TraversalMachine;
use serde_json::json;

fn outputs(pairs: &[(&str, &str)]) -> OutputValues {
    pairs
        .iter()
        .map(|(port, text)| ((*port).to_string(), (*text).into()))
        .collect()
}

#[test]
fn optional_edge_never_gates_firing() {
    let graph = GraphDescriptor {
        nodes: vec![
            NodeDescriptor::new("main", "t"),
            NodeDescriptor::new("side", "t"),
            NodeDescriptor::new("sink", "t"),
        ],
        edges: vec![
            Edge::new("main", "sink").ports("value", "value"),
            Edge {
                optional: true,
                ..Edge::new("side", "sink").ports("extra", "extra")
            },
        ],
        ..Default::default()
    };
    let mut machine = TraversalMachine::new(Arc::new(graph), Some("main")).unwrap();

    let main = machine.next_result().unwrap();
    machine.complete(&main, &outputs(&[("value", "v")]));

    // "side" never ran, yet "sink" fires: the optional edge does not count
    // toward required inputs.
    let sink = machine.next_result().unwrap();
    assert_eq!(sink.descriptor.id, "sink");
    assert!(!sink.skip);
    assert_eq!(sink.inputs["value"].as_str(), Some("v"));
    assert!(!sink.inputs.contains_key("extra"));
}

#[test]
fn constant_edge_redelivers_on_every_firing() {
    let graph = GraphDescriptor {
        nodes: vec![
            NodeDescriptor::new("seed", "t"),
            NodeDescriptor::new("worker", "t"),
        ],
        edges: vec![
            Edge::new("seed", "worker").ports("token", "token").constant(),
            Edge::new("seed", "worker").ports("tick", "tick"),
        ],
        ..Default::default()
    };
    let mut machine = TraversalMachine::new(Arc::new(graph), None).unwrap();

    let seed = machine.next_result().unwrap();
    machine.complete(&seed, &outputs(&[("token", "k"), ("tick", "1")]));

    // First opportunity: both values present, firing consumes the tick.
    let worker = machine.next_result().unwrap();
    assert_eq!(worker.descriptor.id, "worker");
    assert!(!worker.skip);
    assert_eq!(worker.inputs["token"].as_str(), Some("k"));
    assert_eq!(worker.inputs["tick"].as_str(), Some("1"));
    machine.complete(&worker, &OutputValues::default());

    // Second opportunity: the queued tick is gone, the constant token is
    // still there.
    let again = machine.next_result().unwrap();
    assert_eq!(again.descriptor.id, "worker");
    assert!(again.skip);
    assert_eq!(again.missing_inputs, vec!["tick"]);
    assert_eq!(again.inputs["token"].as_str(), Some("k"));
}

#[test]
fn wildcard_edge_carries_every_output_key() {
    let graph = GraphDescriptor {
        nodes: vec![
            NodeDescriptor::new("fan", "t"),
            NodeDescriptor::new("sink", "t"),
        ],
        edges: vec![Edge {
            out: Some("*".to_string()),
            ..Edge::new("fan", "sink")
        }],
        ..Default::default()
    };
    let mut machine = TraversalMachine::new(Arc::new(graph), None).unwrap();

    let fan = machine.next_result().unwrap();
    machine.complete(&fan, &outputs(&[("alpha", "1"), ("beta", "2")]));

    let sink = machine.next_result().unwrap();
    assert_eq!(sink.inputs["alpha"].as_str(), Some("1"));
    assert_eq!(sink.inputs["beta"].as_str(), Some("2"));
}

#[tokio::test]
async fn unfireable_node_surfaces_as_skip_event() {
    let graph = GraphDescriptor {
        nodes: vec![
            NodeDescriptor::new("ask", "input"),
            NodeDescriptor::new("join", "uppercase"),
            NodeDescriptor::new("other", "uppercase"),
            NodeDescriptor::new("answer", "output"),
        ],
        edges: vec![
            Edge::new("ask", "join").ports("text", "text"),
            // never satisfied: "other" has no inputs and never fires
            Edge::new("other", "join").ports("more", "more"),
            Edge::new("join", "answer").ports("text", "text"),
        ],
        ..Default::default()
    };
    let runner = LocalRunner::new(graph).with_kit(text_kit());
    let events = drive(
        runner.run().expect("run starts"),
        values(&[("text", json!("x"))]),
    )
    .await;
    let tags = tags(&events);
    assert!(tags.contains(&"skip"));
    assert!(tags.ends_with(&["graphend"]));
}

#[tokio::test]
async fn configuration_merges_under_delivered_inputs() {
    let mut configured = NodeDescriptor::new("shout", "uppercase");
    configured
        .configuration
        .insert("text".to_string(), "from-config".into());
    let graph = GraphDescriptor {
        nodes: vec![configured, NodeDescriptor::new("answer", "output")],
        edges: vec![Edge::new("shout", "answer").ports("text", "text")],
        ..Default::default()
    };
    let runner = LocalRunner::new(graph).with_kit(text_kit());
    let events = drive(runner.run().expect("run starts"), values(&[])).await;
    let output = first_output(&events).expect("an output fires");
    assert_eq!(output.outputs["text"].as_str(), Some("FROM-CONFIG"));
}
