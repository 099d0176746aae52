use super::*;

#[test]
fn frames_split_across_chunks_are_reassembled() {
    let mut decoder = SseDecoder::default();
    assert!(decoder
        .ingest_chunk(b"event: message_start\ndata: {\"a\"")
        .is_empty());
    let frames = decoder.ingest_chunk(b":1}\r\n\r\n: keep-alive\n\ndata: [DONE]\n\n");
    assert_eq!(
        frames,
        vec![
            SseFrame::named("message_start", "{\"a\":1}"),
            SseFrame::data("[DONE]"),
        ]
    );
    assert!(frames[1].is_done_marker());
}

#[test]
fn multi_line_data_is_joined() {
    let mut decoder = SseDecoder::default();
    let frames = decoder.ingest_chunk(b"data: one\ndata:two\n\n");
    assert_eq!(frames, vec![SseFrame::data("one\ntwo")]);
}

#[test]
fn finish_flushes_unterminated_frame() {
    let mut decoder = SseDecoder::default();
    assert!(decoder.ingest_chunk(b"event: ping\ndata: {}").is_empty());
    assert_eq!(decoder.finish(), Some(SseFrame::named("ping", "{}")));
    assert_eq!(decoder.finish(), None);
}

#[test]
fn frame_serializes_event_and_data_lines() {
    let frame = SseFrame::named("content_block_stop", "{\"index\":0}");
    assert_eq!(
        frame.to_bytes().as_ref(),
        b"event: content_block_stop\ndata: {\"index\":0}\n\n"
    );
    assert_eq!(SseFrame::data("a\nb").to_bytes().as_ref(), b"data: a\ndata: b\n\n");
}
