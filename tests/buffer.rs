use reactor_rpc::net::Buffer;

#[test]
fn growing_buffer_across_many_small_pushes_preserves_order() {
    let mut buf = Buffer::new();
    for i in 0..1000u32 {
        buf.push_data(&i.to_be_bytes());
    }
    assert_eq!(buf.len(), 4000);

    for i in 0..1000u32 {
        assert_eq!(buf.peek(4), i.to_be_bytes());
        buf.consume(4);
    }
    assert!(buf.is_empty());
}

#[test]
fn reserve_grows_capacity_without_losing_existing_data() {
    let mut buf = Buffer::new();
    buf.push_data(b"abc");
    buf.reserve(4096);
    assert!(buf.capacity() >= 4096 + 3);
    assert_eq!(buf.peek_all(), b"abc");
}

#[test]
fn split_to_drains_partial_frames_like_the_outbound_write_path() {
    let mut buf = Buffer::with_capacity(64);
    buf.push_data(b"framed-payload");
    let head = buf.split_to(6);
    assert_eq!(&head[..], b"framed");
    assert_eq!(buf.peek_all(), b"-payload");
}
