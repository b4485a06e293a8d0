use flowboard::graph::{InputValues, NodeValue, OutputValues};
use flowboard::kit::{HandlerError, Kit};
use serde_json::Value;

/// Build a value map from `(port, json)` pairs.
pub fn values(pairs: &[(&str, Value)]) -> InputValues {
    pairs
        .iter()
        .map(|(port, value)| ((*port).to_string(), NodeValue::from(value.clone())))
        .collect()
}

pub fn text_of(outputs: &OutputValues, port: &str) -> String {
    outputs
        .get(port)
        .and_then(NodeValue::as_str)
        .unwrap_or_default()
        .to_string()
}

/// The standard test kit: simple string transforms plus a failing handler.
pub fn text_kit() -> Kit {
    Kit::new("test://text")
        .with_fn("uppercase", |inputs, _ctx| async move {
            let text = text_in(&inputs, "text").to_uppercase();
            Ok(out("text", text))
        })
        .with_fn("reverser", |inputs, _ctx| async move {
            let text: String = text_in(&inputs, "text").chars().rev().collect();
            Ok(out("text", text))
        })
        .with_fn("echo", |inputs, _ctx| async move { Ok(inputs) })
        .with_fn("fail", |_inputs, _ctx| async move {
            Err::<OutputValues, _>(HandlerError::failed("intentional failure"))
        })
}

fn text_in(inputs: &InputValues, port: &str) -> String {
    inputs
        .get(port)
        .and_then(NodeValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn out(port: &str, text: String) -> OutputValues {
    [(port.to_string(), text.into())].into_iter().collect()
}
