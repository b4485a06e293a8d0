#[macro_use]
extern crate proptest;

use flowboard::remote::SseDecoder;
use proptest::prelude::prop;
use serde_json::{Value, json};

/// Feed `body` to a decoder in chunks whose lengths cycle through `sizes`.
fn decode_in_chunks(body: &[u8], sizes: &[usize]) -> Vec<Value> {
    let mut decoder = SseDecoder::new();
    let mut decoded = Vec::new();
    let mut cursor = 0;
    let mut step = 0;
    while cursor < body.len() {
        let len = sizes[step % sizes.len()].min(body.len() - cursor);
        decoded.extend(
            decoder
                .push_bytes(&body[cursor..cursor + len])
                .expect("well-formed body decodes"),
        );
        cursor += len;
        step += 1;
    }
    if let Some(payload) = decoder.finish().expect("well-formed body flushes") {
        decoded.push(payload);
    }
    decoded
}

proptest! {
    // However a well-formed SSE body is sliced into network chunks, the
    // decoder recovers exactly the frames that went in.
    #[test]
    fn prop_chunk_boundaries_never_change_decoded_frames(
        texts in prop::collection::vec("[A-Za-z0-9 .,:-]{0,24}", 1..8),
        sizes in prop::collection::vec(1..16usize, 1..32),
    ) {
        let payloads: Vec<Value> = texts
            .iter()
            .map(|text| json!(["output", { "outputs": { "text": text } }]))
            .collect();
        let body: Vec<u8> = payloads
            .iter()
            .flat_map(|payload| format!("data: {payload}\n\n").into_bytes())
            .collect();

        prop_assert_eq!(decode_in_chunks(&body, &sizes), payloads);
    }

    // A trailing frame whose terminating blank line was cut off by the
    // connection closing is still recovered by the final flush.
    #[test]
    fn prop_unterminated_trailing_frame_survives_finish(
        text in "[A-Za-z0-9 ]{0,24}",
        sizes in prop::collection::vec(1..16usize, 1..32),
    ) {
        let payload = json!(["error", { "error": text }]);
        let body = format!("data: {payload}").into_bytes();

        prop_assert_eq!(decode_in_chunks(&body, &sizes), vec![payload]);
    }
}
