//! Dispatch behavior of running loopers
//!
//! Handlers report what they see through crossbeam channels; every test runs
//! real dispatch threads and quits them before returning.

use crossbeam_channel::{unbounded, Receiver};
use messaging_actors::codec::constants::{
    fields, MESSAGE_NOT_UNDERSTOOD, NO_REPLY, OBSERVER_NOTICE_CHANGE, QUIT, QUIT_REQUESTED, REPLY,
};
use messaging_actors::{
    Dispatch, FilterResult, Handler, HandlerRef, Looper, LooperState, Message, MessageFilter, MessagingError,
    Messenger, Reply,
};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

fn init() {
    looper_config::logging::init_for_tests();
}

/// Handler that forwards every `what` it receives
fn recorder(name: &str) -> (HandlerRef, Receiver<u32>) {
    let (tx, rx) = unbounded();
    let handler = HandlerRef::from_fn(name, move |message: &mut Message, _ctx: &mut Dispatch<'_>| {
        let _ = tx.send(message.what());
    });
    (handler, rx)
}

/// Handler that reports the thread it was dispatched on
fn thread_probe(name: &str) -> (HandlerRef, Receiver<ThreadId>) {
    let (tx, rx) = unbounded();
    let handler = HandlerRef::from_fn(name, move |_message: &mut Message, _ctx: &mut Dispatch<'_>| {
        let _ = tx.send(thread::current().id());
    });
    (handler, rx)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_posted_message_dispatched_once() {
    init();
    let looper = Looper::new("once");
    let (handler, rx) = recorder("recorder");
    looper.add_handler(&handler).unwrap();
    looper.run().unwrap();

    looper.post_message_to(Message::new(0x1234), &handler).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 0x1234);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    assert!(looper.remove_handler(&handler));
    looper.quit();
}

#[test]
fn test_messages_from_one_thread_arrive_in_order() {
    init();
    let (tx, rx) = unbounded();
    let looper = Looper::with_handler(
        "fifo",
        messaging_actors::FnHandler(move |message: &mut Message, _ctx: &mut Dispatch<'_>| {
            if let Ok(seq) = message.find::<i32>("seq", 0) {
                let _ = tx.send(seq);
            }
        }),
    );
    looper.run().unwrap();

    let messenger = looper.messenger();
    for seq in 0..200 {
        let mut message = Message::new(0x5345);
        message.add("seq", seq).unwrap();
        messenger.send_message(message).unwrap();
    }

    let received: Vec<i32> = (0..200).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(received, (0..200).collect::<Vec<_>>());
    looper.quit();
}

#[test]
fn test_handler_chain_is_closed() {
    init();
    let looper = Looper::new("ring");
    let handlers: Vec<HandlerRef> = (0..4).map(|i| recorder(&format!("h{}", i)).0).collect();
    for handler in &handlers {
        looper.add_handler(handler).unwrap();
    }

    let start = looper.root_handler();
    let mut current = start.clone();
    for _ in 0..looper.count_handlers() {
        current = current.next_handler().unwrap();
    }
    assert_eq!(current, start);

    for handler in &handlers {
        looper.remove_handler(handler);
    }
    looper.quit();
}

#[test]
fn test_unhandled_message_falls_through_to_looper_handler() {
    init();
    let looper = Looper::new("fallthrough");
    let (tx, rx) = unbounded();
    let front = HandlerRef::from_fn("front", move |message: &mut Message, ctx: &mut Dispatch<'_>| {
        let _ = tx.send(message.what());
        ctx.pass_to_next(message);
    });
    looper.add_handler(&front).unwrap();
    looper.run().unwrap();

    let messenger = Messenger::for_handler(&front, Some(&looper)).unwrap();
    let reply = messenger.send_and_wait(Message::new(0x7777), Some(WAIT)).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 0x7777);
    assert_eq!(reply.what(), MESSAGE_NOT_UNDERSTOOD);
    assert!(reply.is_reply());

    looper.remove_handler(&front);
    looper.quit();
}

#[test]
fn test_proxy_moves_dispatch_between_threads() {
    init();
    let a = Looper::new("proxy-root");
    let b = Looper::new("proxy-client");
    let (probe, rx) = thread_probe("probe");
    b.add_handler(&probe).unwrap();
    let a_thread = a.run().unwrap();
    let b_thread = b.run().unwrap();

    b.post_message_to(Message::new(1), &probe).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), b_thread);

    {
        let _guard = b.lock().unwrap();
        b.proxy_by(Some(&a)).unwrap();
        assert_eq!(a.count_clients(), 1);
    }
    b.post_message_to(Message::new(2), &probe).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), a_thread);

    {
        let _guard = b.lock().unwrap();
        b.proxy_by(None).unwrap();
    }
    assert_eq!(a.count_clients(), 0);
    b.post_message_to(Message::new(3), &probe).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), b_thread);

    b.remove_handler(&probe);
    b.quit();
    a.quit();
}

#[test]
fn test_quitting_root_releases_clients() {
    init();
    let a = Looper::new("quitting-root");
    let b = Looper::new("survivor");
    let (probe, rx) = thread_probe("probe");
    b.add_handler(&probe).unwrap();
    a.run().unwrap();
    let b_thread = b.run().unwrap();

    {
        let _guard = b.lock().unwrap();
        b.proxy_by(Some(&a)).unwrap();
    }
    a.quit();
    assert!(!b.is_proxied());

    b.post_message_to(Message::new(1), &probe).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), b_thread);

    b.remove_handler(&probe);
    b.quit();
}

#[test]
fn test_run_on_proxied_looper_is_rejected() {
    init();
    let a = Looper::new("host");
    let b = Looper::new("guest");
    {
        let _guard = b.lock().unwrap();
        b.proxy_by(Some(&a)).unwrap();
    }
    assert!(matches!(b.run(), Err(MessagingError::BadValue(_))));
    b.quit();
    a.quit();
}

#[test]
fn test_quit_from_dispatch_thread_panics() {
    init();
    let (tx, rx) = unbounded();
    let looper = Looper::with_handler(
        "self-quit",
        messaging_actors::FnHandler(move |_message: &mut Message, ctx: &mut Dispatch<'_>| {
            let looper = ctx.looper().clone();
            let outcome = panic::catch_unwind(AssertUnwindSafe(move || looper.quit()));
            let _ = tx.send(outcome.is_err());
        }),
    );
    looper.run().unwrap();
    looper.post_what(0x4242).unwrap();
    assert!(rx.recv_timeout(WAIT).unwrap());
    assert!(looper.is_running());
    looper.quit();
}

#[test]
fn test_quit_message_stops_the_looper() {
    init();
    let looper = Looper::new("posted-quit");
    looper.run().unwrap();
    looper.post_what(QUIT).unwrap();
    assert!(wait_until(|| looper.state() == LooperState::Destroyed));
    assert!(matches!(looper.post_what(1), Err(MessagingError::BadHandler(_))));
    looper.quit();
}

#[test]
fn test_stale_messenger_is_rejected() {
    init();
    let looper = Looper::new("stale");
    let (handler, _rx) = recorder("doomed");
    looper.add_handler(&handler).unwrap();
    looper.run().unwrap();

    let messenger = Messenger::for_handler(&handler, None).unwrap();
    assert!(messenger.is_valid());

    looper.remove_handler(&handler);
    drop(handler);
    assert!(!messenger.is_valid());
    assert!(matches!(messenger.send_what(1), Err(MessagingError::BadHandler(_))));

    let looper_messenger = looper.messenger();
    assert!(looper_messenger.is_valid());
    looper.quit();
    assert!(!looper_messenger.is_valid());
    assert!(matches!(looper_messenger.send_what(1), Err(MessagingError::BadHandler(_))));
}

#[test]
fn test_send_and_wait_replies() {
    init();
    let (kept_tx, kept_rx) = unbounded();
    let looper = Looper::with_handler(
        "replier",
        messaging_actors::FnHandler(move |message: &mut Message, ctx: &mut Dispatch<'_>| match message.what() {
            1 => {
                let mut reply = Message::new(2);
                reply.add("answer", 42i32).unwrap();
                message.send_reply(reply).unwrap();
            }
            // Dropped unanswered: the sender sees NO_REPLY
            3 => {}
            // Kept alive past the sender's timeout
            4 => {
                let detached = ctx.detach(message);
                let _ = kept_tx.send(detached);
            }
            _ => {}
        }),
    );
    looper.run().unwrap();
    let messenger = looper.messenger();

    let reply = messenger.send_and_wait(Message::new(1), Some(WAIT)).unwrap();
    assert_eq!(reply.what(), 2);
    assert_eq!(reply.find::<i32>("answer", 0).unwrap(), 42);

    let reply = messenger.send_and_wait(Message::new(3), Some(WAIT)).unwrap();
    assert_eq!(reply.what(), NO_REPLY);

    let started = Instant::now();
    let reply = messenger.send_and_wait(Message::new(4), Some(Duration::from_millis(50))).unwrap();
    assert_eq!(reply.what(), NO_REPLY);
    assert!(reply.is_reply());
    assert!(started.elapsed() >= Duration::from_millis(50));
    // Answering after the sender gave up goes nowhere
    let mut late = kept_rx.recv_timeout(WAIT).unwrap();
    assert!(late.send_reply_what(5).is_err());

    looper.quit();
}

#[test]
fn test_preferred_handler_receives_untargeted_sends() {
    init();
    let looper = Looper::new("preferring");
    let (preferred, rx) = recorder("preferred");
    looper.add_handler(&preferred).unwrap();
    looper.set_preferred_handler(Some(&preferred)).unwrap();
    looper.run().unwrap();

    looper.messenger().send_what(4).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 4);

    // Without a preferred handler the looper's own handler takes the message
    looper.set_preferred_handler(None).unwrap();
    looper.messenger().send_what(6).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    let stranger = HandlerRef::new("stranger", messaging_actors::DefaultHandler);
    assert!(matches!(
        looper.set_preferred_handler(Some(&stranger)),
        Err(MessagingError::BadHandler(_))
    ));

    looper.remove_handler(&preferred);
    looper.quit();
}

#[test]
fn test_replies_reach_the_reply_target() {
    init();
    let looper = Looper::new("reply-routing");
    let answerer = HandlerRef::from_fn("answerer", |message: &mut Message, _ctx: &mut Dispatch<'_>| {
        if !message.is_reply() {
            let answer = Message::new(message.what() + 100);
            let _ = message.send_reply(answer);
        }
    });
    let (tx, rx) = unbounded();
    let sink = HandlerRef::from_fn("sink", move |message: &mut Message, _ctx: &mut Dispatch<'_>| {
        let _ = tx.send((message.what(), message.is_reply()));
    });
    looper.add_handler(&answerer).unwrap();
    looper.add_handler(&sink).unwrap();
    looper.run().unwrap();

    looper.post_message_with_reply(Message::new(5), &answerer, &sink).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (105, true));

    let messenger = Messenger::for_handler(&answerer, Some(&looper)).unwrap();
    messenger.send_message_with_reply(Message::new(7), &sink).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (107, true));

    // No reply target and no waiting sender: nothing comes back
    messenger.send_what(9).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    looper.remove_handler(&answerer);
    looper.remove_handler(&sink);
    looper.quit();
}

#[test]
fn test_per_thread_order_survives_proxy_switching() {
    init();
    const SENDERS: i32 = 3;
    const PER_SENDER: i32 = 300;

    let a = Looper::new("switch-root");
    let b = Looper::new("switch-client");
    let (tx, rx) = unbounded();
    let sink = HandlerRef::from_fn("ordered-sink", move |message: &mut Message, _ctx: &mut Dispatch<'_>| {
        if let (Ok(source), Ok(seq)) = (message.find::<i32>("source", 0), message.find::<i32>("seq", 0)) {
            let _ = tx.send((source, seq));
        }
    });
    b.add_handler(&sink).unwrap();
    a.run().unwrap();
    b.run().unwrap();

    let messenger = Messenger::for_handler(&sink, Some(&b)).unwrap();
    let senders: Vec<_> = (0..SENDERS)
        .map(|source| {
            thread::spawn(move || {
                for seq in 0..PER_SENDER {
                    let mut message = Message::new(0x4f52);
                    message.add("source", source).unwrap();
                    message.add("seq", seq).unwrap();
                    messenger.send_message(message).unwrap();
                }
            })
        })
        .collect();

    for round in 0..50 {
        let _guard = b.lock().unwrap();
        if round % 2 == 0 {
            b.proxy_by(Some(&a)).unwrap();
        } else {
            b.proxy_by(None).unwrap();
        }
    }
    {
        let _guard = b.lock().unwrap();
        b.proxy_by(None).unwrap();
    }
    for sender in senders {
        sender.join().unwrap();
    }

    let mut next = vec![0; SENDERS as usize];
    for _ in 0..SENDERS * PER_SENDER {
        let (source, seq) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(seq, next[source as usize], "source {} out of order", source);
        next[source as usize] += 1;
    }
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    b.remove_handler(&sink);
    b.quit();
    a.quit();
}

#[test]
fn test_send_and_wait_on_own_thread_is_refused() {
    init();
    let (tx, rx) = unbounded();
    let looper = Looper::with_handler(
        "self-wait",
        messaging_actors::FnHandler(move |message: &mut Message, ctx: &mut Dispatch<'_>| {
            if message.what() == 1 {
                let outcome = ctx.looper().messenger().send_and_wait(Message::new(2), None);
                let _ = tx.send(matches!(outcome, Err(MessagingError::BadValue(_))));
            }
        }),
    );
    looper.run().unwrap();
    looper.post_what(1).unwrap();
    assert!(rx.recv_timeout(WAIT).unwrap());
    looper.quit();
}

#[test]
fn test_filters_skip_and_redirect() {
    init();
    let looper = Looper::new("filtered");
    let (first, first_rx) = recorder("first");
    let (second, second_rx) = recorder("second");
    looper.add_handler(&first).unwrap();
    looper.add_handler(&second).unwrap();

    looper.add_common_filter(MessageFilter::for_what(7).with_hook(|_message, _target| FilterResult::Skip));
    let redirect_to = second.clone();
    first.add_filter(MessageFilter::for_what(9).with_hook(move |_message, target| {
        *target = redirect_to.clone();
        FilterResult::Dispatch
    }));
    looper.run().unwrap();

    looper.post_message_to(Message::new(7), &first).unwrap();
    looper.post_message_to(Message::new(9), &first).unwrap();
    looper.post_message_to(Message::new(8), &first).unwrap();

    assert_eq!(second_rx.recv_timeout(WAIT).unwrap(), 9);
    assert_eq!(first_rx.recv_timeout(WAIT).unwrap(), 8);
    assert!(first_rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(second_rx.try_recv().is_err());

    looper.remove_handler(&first);
    looper.remove_handler(&second);
    looper.quit();
}

#[test]
fn test_observers_receive_notices() {
    init();
    let looper = Looper::new("observed");
    let subject = HandlerRef::new("subject", messaging_actors::DefaultHandler);
    let (tx, rx) = unbounded();
    let watcher = HandlerRef::from_fn("watcher", move |message: &mut Message, _ctx: &mut Dispatch<'_>| {
        if let Ok(change) = message.find::<i32>(fields::OBSERVE_CHANGE_WHAT, 0) {
            let original = message.find::<i32>(fields::OBSERVE_ORIGINAL_WHAT, 0).ok();
            let _ = tx.send((message.what(), change as u32, original));
        }
    });
    looper.add_handler(&subject).unwrap();
    looper.add_handler(&watcher).unwrap();
    looper.run().unwrap();

    let observer = Messenger::for_handler(&watcher, None).unwrap();
    subject.start_watching_all(observer).unwrap();
    subject.stop_watching(&observer, 2).unwrap();
    assert!(subject.is_watched(1));
    assert!(!subject.is_watched(2));

    assert_eq!(subject.send_notices(1, None), 1);
    assert_eq!(subject.send_notices(2, None), 0);
    assert_eq!(subject.send_notices(3, Some(&Message::new(0x99))), 1);

    let (what, change, original) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!((what, change, original), (OBSERVER_NOTICE_CHANGE, 1, None));
    let (_, change, original) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!((change, original), (3, Some(0x99)));

    looper.remove_handler(&subject);
    looper.remove_handler(&watcher);
    looper.quit();
}

#[test]
fn test_remote_watch_request() {
    init();
    let looper = Looper::new("remote-watch");
    let subject = HandlerRef::new("subject", messaging_actors::DefaultHandler);
    let watcher = HandlerRef::new("watcher", messaging_actors::DefaultHandler);
    looper.add_handler(&subject).unwrap();
    looper.add_handler(&watcher).unwrap();
    looper.run().unwrap();

    let target = Messenger::for_handler(&subject, None).unwrap();
    watcher.request_watching(&target, 5).unwrap();
    assert!(wait_until(|| subject.is_watched(5)));
    assert!(!subject.is_watched(6));

    watcher.request_stop_watching(&target, 5).unwrap();
    assert!(wait_until(|| !subject.is_watched(5)));

    looper.remove_handler(&subject);
    looper.remove_handler(&watcher);
    looper.quit();
}

#[test]
fn test_dead_observers_are_pruned() {
    init();
    let subject_looper = Looper::new("subject-home");
    let watcher_looper = Looper::new("watcher-home");
    let subject = HandlerRef::new("subject", messaging_actors::DefaultHandler);
    subject_looper.add_handler(&subject).unwrap();

    subject.start_watching(watcher_looper.messenger(), 1).unwrap();
    watcher_looper.quit();
    assert_eq!(subject.send_notices(1, None), 0);
    assert!(!subject.is_watched(1));

    subject_looper.remove_handler(&subject);
    subject_looper.quit();
}

#[test]
fn test_bounded_queue_reports_would_block() {
    init();
    let settings = looper_config::RuntimeConfig::from_toml("[looper]\nqueue_capacity = 1\n")
        .unwrap()
        .looper;
    let looper = Looper::builder("bounded").settings(settings).build();
    let messenger = looper.messenger();

    messenger.send_message_timeout(Message::new(1), Duration::ZERO).unwrap();
    assert!(matches!(
        messenger.send_message_timeout(Message::new(2), Duration::ZERO),
        Err(MessagingError::WouldBlock(_))
    ));
    assert!(matches!(
        messenger.send_message_timeout(Message::new(3), Duration::from_millis(20)),
        Err(MessagingError::TimedOut { .. })
    ));
    assert_eq!(looper.queue_len(), 1);
    looper.quit();
}

#[test]
fn test_lock_contention_and_counts() {
    init();
    let looper = Looper::new("contended");
    let guard = looper.lock().unwrap();
    assert_eq!(looper.count_locks(), 1);

    let other = looper.clone();
    let (zero, short) = thread::spawn(move || {
        let zero = other.lock_with_timeout(Duration::ZERO).map(|_| ());
        let short = other.lock_with_timeout(Duration::from_millis(20)).map(|_| ());
        (zero, short)
    })
    .join()
    .unwrap();
    assert!(matches!(zero, Err(MessagingError::WouldBlock(_))));
    assert!(matches!(short, Err(MessagingError::TimedOut { .. })));

    drop(guard);
    let other = looper.clone();
    let acquired = thread::spawn(move || {
        let guard = other.lock_with_timeout(WAIT);
        let counted = other.count_locks();
        drop(guard);
        counted
    })
    .join()
    .unwrap();
    assert_eq!(acquired, 1);
    looper.quit();
}

struct Stubborn {
    allow: bool,
}

impl Handler for Stubborn {
    fn quit_requested(&mut self) -> bool {
        self.allow
    }
}

#[test]
fn test_quit_requested_consults_looper_handler() {
    init();
    let refuses = Looper::with_handler("refuses", Stubborn { allow: false });
    refuses.run().unwrap();
    let reply = refuses
        .messenger()
        .send_and_wait(Message::new(QUIT_REQUESTED), Some(WAIT))
        .unwrap();
    assert_eq!(reply.what(), REPLY);
    assert!(!reply.find::<bool>(fields::RESULT, 0).unwrap());
    assert!(refuses.is_running());
    refuses.quit();

    let agrees = Looper::with_handler("agrees", Stubborn { allow: true });
    agrees.run().unwrap();
    let reply = agrees
        .messenger()
        .send_and_wait(Message::new(QUIT_REQUESTED), Some(WAIT))
        .unwrap();
    assert!(reply.find::<bool>(fields::RESULT, 0).unwrap());
    assert!(wait_until(|| agrees.state() == LooperState::Destroyed));
    agrees.quit();
}

#[test]
fn test_current_looper_is_visible_from_dispatch_thread() {
    init();
    let (tx, rx) = unbounded();
    let looper = Looper::with_handler(
        "whoami",
        messaging_actors::FnHandler(move |_message: &mut Message, _ctx: &mut Dispatch<'_>| {
            let found = messaging_actors::looper_for_thread().map(|l| l.name().to_string());
            let _ = tx.send(found);
        }),
    );
    looper.run().unwrap();
    assert!(messaging_actors::looper_for_thread().is_none());
    assert!(messaging_actors::loopers().contains(&looper));

    looper.post_what(1).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().as_deref(), Some("whoami"));
    looper.clone().quit();
    assert!(!messaging_actors::loopers().contains(&looper));
}
