use std::sync::{Arc, Mutex};

use googletest::prelude::*;
use rstest::rstest;

use crate::registry::{ChannelRegistry, ImmediateDispatcher};
use crate::subscriber::{PubMessage, SubscriberSink};

#[derive(Default)]
struct RecordingSink {
    received: Mutex<Vec<PubMessage>>,
}

impl RecordingSink {
    fn messages(&self) -> Vec<PubMessage> {
        self.received
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl SubscriberSink for RecordingSink {
    fn deliver(&self, message: PubMessage) {
        self.received
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(message);
    }
}

fn registry() -> (ChannelRegistry, ImmediateDispatcher) {
    let dispatcher = ImmediateDispatcher::new(4);
    (ChannelRegistry::new(Arc::new(dispatcher)), dispatcher)
}

fn session() -> (Arc<RecordingSink>, Arc<dyn SubscriberSink>) {
    let sink = Arc::new(RecordingSink::default());
    let dyn_sink: Arc<dyn SubscriberSink> = sink.clone();
    (sink, dyn_sink)
}

#[rstest]
fn exact_subscription_receives_published_messages() {
    let (registry, dispatcher) = registry();
    let (sink, dyn_sink) = session();
    registry.subscribe(&["news"], false, &dyn_sink, 0);

    let reached = registry.send_messages("news", &[b"hello".to_vec()], &dispatcher);
    assert_that!(reached, eq(1));
    let messages = sink.messages();
    assert_that!(messages.len(), eq(1));
    assert_that!(messages[0].channel.as_slice(), eq(b"news".as_slice()));
    assert_that!(messages[0].message.as_slice(), eq(b"hello".as_slice()));
    assert_that!(messages[0].pattern, eq(&None));
}

#[rstest]
fn pattern_fanout_reaches_pattern_and_exact_subscribers() {
    let (registry, dispatcher) = registry();
    let (pattern_sink, pattern_session) = session();
    let (exact_sink, exact_session) = session();
    registry.subscribe(&["news.*"], true, &pattern_session, 0);
    registry.subscribe(&["news.sports"], false, &exact_session, 1);

    let reached = registry.send_messages("news.sports", &[b"hi".to_vec()], &dispatcher);
    assert_that!(reached, eq(2));
    assert_that!(exact_sink.messages().len(), eq(1));
    let pattern_messages = pattern_sink.messages();
    assert_that!(pattern_messages.len(), eq(1));
    assert_that!(
        pattern_messages[0].pattern,
        eq(&Some("news.*".to_owned()))
    );

    // After the pattern subscriber leaves, only the exact one is reached.
    registry.unsubscribe(&["news.*"], true, &pattern_session);
    let reached = registry.send_messages("news.sports", &[b"hi2".to_vec()], &dispatcher);
    assert_that!(reached, eq(1));
    assert_that!(pattern_sink.messages().len(), eq(1));
    assert_that!(exact_sink.messages().len(), eq(2));
}

#[rstest]
fn unsubscribed_channels_disappear_from_the_store() {
    let (registry, _) = registry();
    let (_sink, dyn_sink) = session();
    registry.subscribe(&["a", "b"], false, &dyn_sink, 0);
    assert_that!(
        registry.current().list_channels(""),
        eq(&vec!["a".to_owned(), "b".to_owned()])
    );

    registry.unsubscribe(&["a"], false, &dyn_sink);
    assert_that!(registry.current().list_channels(""), eq(&vec!["b".to_owned()]));
}

#[rstest]
fn publish_to_a_silent_channel_reaches_no_one() {
    let (registry, dispatcher) = registry();
    assert_that!(
        registry.send_messages("empty", &[b"x".to_vec()], &dispatcher),
        eq(0)
    );
}

#[rstest]
fn expired_sessions_are_silently_skipped() {
    let (registry, dispatcher) = registry();
    let (sink, dyn_sink) = session();
    registry.subscribe(&["ch"], false, &dyn_sink, 0);

    drop(dyn_sink);
    drop(sink);
    // The weak reference expired; publish neither fails nor delivers.
    let reached = registry.send_messages("ch", &[b"x".to_vec()], &dispatcher);
    assert_that!(reached, eq(1));
}

#[rstest]
fn readers_holding_an_old_snapshot_stay_valid_across_updates() {
    let (registry, dispatcher) = registry();
    let (sink, dyn_sink) = session();
    registry.subscribe(&["stable"], false, &dyn_sink, 0);

    // A publisher working on a pre-update snapshot still sees consistent state.
    let old_snapshot = registry.current();
    let (_sink2, dyn_sink2) = session();
    registry.subscribe(&["added-later"], false, &dyn_sink2, 2);

    let subscribers = old_snapshot.fetch_subscribers("stable");
    assert_that!(subscribers.len(), eq(1));
    assert_that!(old_snapshot.fetch_subscribers("added-later").len(), eq(0));
    assert_that!(
        registry.current().fetch_subscribers("added-later").len(),
        eq(1)
    );

    let reached = registry.send_messages("stable", &[b"x".to_vec()], &dispatcher);
    assert_that!(reached, eq(1));
    assert_that!(sink.messages().len(), eq(1));
}

#[rstest]
fn subscribers_are_grouped_and_ordered_by_thread() {
    let (registry, _) = registry();
    let mut sessions = Vec::new();
    for thread in [3_u32, 1, 2, 1, 0] {
        let (sink, dyn_sink) = session();
        registry.subscribe(&["busy"], false, &dyn_sink, thread);
        sessions.push((sink, dyn_sink));
    }

    let subscribers = registry.current().fetch_subscribers("busy");
    let threads: Vec<u32> = subscribers.iter().map(|s| s.thread_id).collect();
    let mut sorted = threads.clone();
    sorted.sort_unstable();
    assert_that!(threads, eq(&sorted));
}

#[rstest]
fn multiple_subscribers_on_one_channel_all_receive() {
    let (registry, dispatcher) = registry();
    let mut sinks = Vec::new();
    let mut sessions = Vec::new();
    for thread in 0..3 {
        let (sink, dyn_sink) = session();
        registry.subscribe(&["wide"], false, &dyn_sink, thread);
        sinks.push(sink);
        sessions.push(dyn_sink);
    }

    let reached =
        registry.send_messages("wide", &[b"one".to_vec(), b"two".to_vec()], &dispatcher);
    assert_that!(reached, eq(3));
    for sink in &sinks {
        let messages = sink.messages();
        assert_that!(messages.len(), eq(2));
        assert_that!(messages[0].message.as_slice(), eq(b"one".as_slice()));
        assert_that!(messages[1].message.as_slice(), eq(b"two".as_slice()));
    }
}
