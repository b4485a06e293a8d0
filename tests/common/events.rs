use flowboard::graph::InputValues;
use flowboard::run::{EventStream, OutputEvent, RunEvent};

/// Drive a run to completion, answering every input request with `inputs`,
/// and collect everything that happened.
pub async fn drive(mut events: EventStream, inputs: InputValues) -> Vec<RunEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.next().await {
        match event {
            RunEvent::Input(mut request) => {
                if let Some(responder) = request.responder.take() {
                    let _ = responder.respond(inputs.clone());
                }
                seen.push(RunEvent::Input(request));
            }
            other => seen.push(other),
        }
    }
    seen
}

/// The wire tags of a run, in order.
pub fn tags(events: &[RunEvent]) -> Vec<&'static str> {
    events.iter().map(RunEvent::tag).collect()
}

/// The first output event's values, if any.
pub fn first_output(events: &[RunEvent]) -> Option<&OutputEvent> {
    events.iter().find_map(|event| match event {
        RunEvent::Output(output) => Some(output),
        _ => None,
    })
}
