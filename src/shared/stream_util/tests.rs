use super::*;

#[tokio::test]
async fn prefixed_stream_yields_first_then_rest() {
    let mut stream = PrefixedStream::new(1u32, IterStream::new([2u32, 3]));
    assert_eq!(next_item(&mut stream).await, Some(1));
    assert_eq!(next_item(&mut stream).await, Some(2));
    assert_eq!(next_item(&mut stream).await, Some(3));
    assert_eq!(next_item(&mut stream).await, None);
}
