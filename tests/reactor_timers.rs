use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use reactor_rpc::reactor::{Loop, LoopGroup, RepeatCount};

#[tokio::test]
async fn schedule_after_with_repeat_fires_exactly_n_times() {
    let (lp, handle) = Loop::new();
    std::thread::spawn(move || lp.run());

    let count = Arc::new(AtomicU64::new(0));
    let count2 = Arc::clone(&count);
    handle.schedule_after_with_repeat(Duration::from_millis(10), RepeatCount::Finite(5), move |_tick| {
        count2.fetch_add(1, Ordering::SeqCst);
    });

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(count.load(Ordering::SeqCst), 5);
    handle.stop();
}

#[tokio::test]
async fn cancelling_a_repeating_timer_stops_future_ticks() {
    let (lp, handle) = Loop::new();
    std::thread::spawn(move || lp.run());

    let count = Arc::new(AtomicU64::new(0));
    let count2 = Arc::clone(&count);
    let token =
        handle.schedule_after_with_repeat(Duration::from_millis(10), RepeatCount::Forever, move |_tick| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

    tokio::time::sleep(Duration::from_millis(55)).await;
    token.cancel();
    let seen_at_cancel = count.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), seen_at_cancel);
    handle.stop();
}

#[tokio::test]
async fn loop_group_dispatches_round_robin() {
    let group = LoopGroup::start(3);

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(group.next().id());
    }
    assert_eq!(ids[0], ids[3]);
    assert_eq!(ids[1], ids[4]);
    assert_eq!(ids[2], ids[5]);
    assert_ne!(ids[0], ids[1]);

    group.stop();
    group.wait();
}
