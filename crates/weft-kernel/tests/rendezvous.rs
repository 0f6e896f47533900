//! Two-party channel protocol tests.

mod common;

use common::{init_logging, run_process, wait_until};
use weft_kernel::{Channel, Director, RendezvousError, Token, TokenKind};

#[test]
fn receiver_first_then_sender() {
    init_logging();
    let director = Director::new();
    let channel = Channel::new(&director);
    let p1 = director.process_started("p1");
    let p2 = director.process_started("p2");

    let receiver = {
        let channel = channel.clone();
        run_process(&director, p1, move |p| {
            let token = channel.receive(p)?;
            assert_eq!(token, Token::Int(5));
            Ok(())
        })
    };
    wait_until(|| channel.is_read_blocked());

    let sender = {
        let channel = channel.clone();
        run_process(&director, p2, move |p| channel.send(p, Token::Int(5)))
    };

    receiver.join().unwrap().unwrap();
    sender.join().unwrap().unwrap();
    assert!(!channel.is_read_blocked());
    assert!(!channel.is_write_blocked());
    assert_eq!(director.active_count(), 0);
    assert_eq!(director.blocked_count(), 0);
}

#[test]
fn sender_first_then_receiver() {
    init_logging();
    let director = Director::new();
    let channel = Channel::new(&director);
    let p1 = director.process_started("sender");
    let p2 = director.process_started("receiver");

    let sender = {
        let channel = channel.clone();
        run_process(&director, p1, move |p| channel.send(p, Token::Str("hi".into())))
    };
    wait_until(|| channel.is_write_blocked());

    let receiver = {
        let channel = channel.clone();
        run_process(&director, p2, move |p| {
            assert_eq!(channel.receive(p)?, Token::Str("hi".into()));
            Ok(())
        })
    };

    sender.join().unwrap().unwrap();
    receiver.join().unwrap().unwrap();
    assert!(!channel.is_write_blocked());
}

#[test]
fn send_array_delivers_in_order() {
    init_logging();
    let director = Director::new();
    let channel = Channel::new(&director);
    let p1 = director.process_started("sender");
    let p2 = director.process_started("receiver");

    let sender = {
        let channel = channel.clone();
        run_process(&director, p1, move |p| {
            channel.send_array(p, &[Token::Int(1), Token::Int(2), Token::Int(3)])
        })
    };
    let receiver = {
        let channel = channel.clone();
        run_process(&director, p2, move |p| {
            for expected in 1..=3 {
                assert_eq!(channel.receive(p)?, Token::Int(expected));
            }
            Ok(())
        })
    };

    sender.join().unwrap().unwrap();
    receiver.join().unwrap().unwrap();
}

#[test]
fn typed_channel_widens_integers() {
    init_logging();
    let director = Director::new();
    let channel = Channel::with_kind(&director, Some(TokenKind::Float));
    let p1 = director.process_started("sender");
    let p2 = director.process_started("receiver");

    let sender = {
        let channel = channel.clone();
        run_process(&director, p1, move |p| channel.send(p, Token::Int(3)))
    };
    let receiver = {
        let channel = channel.clone();
        run_process(&director, p2, move |p| {
            assert_eq!(channel.receive(p)?, Token::Float(3.0));
            Ok(())
        })
    };

    sender.join().unwrap().unwrap();
    receiver.join().unwrap().unwrap();
}

#[test]
fn typed_channel_rejects_mismatch_synchronously() {
    init_logging();
    let director = Director::new();
    let channel = Channel::with_kind(&director, Some(TokenKind::Int));
    let p1 = director.process_started("sender");

    let sender = {
        let channel = channel.clone();
        run_process(&director, p1, move |p| channel.send(p, Token::Bool(true)))
    };
    let err = sender.join().unwrap().unwrap_err();
    assert!(matches!(err, RendezvousError::TypeMismatch { .. }));
    assert!(!channel.is_write_blocked());
}

#[test]
fn finish_unblocks_waiting_receiver() {
    init_logging();
    let director = Director::new();
    let channel = Channel::new(&director);
    let p1 = director.process_started("receiver");
    // A second registered process keeps the model from counting as
    // deadlocked while the receiver waits.
    let bystander = director.process_started("bystander");

    let receiver = {
        let channel = channel.clone();
        run_process(&director, p1, move |p| channel.receive(p).map(|_| ()))
    };
    wait_until(|| channel.is_read_blocked());

    director.request_finish();
    let err = receiver.join().unwrap().unwrap_err();
    assert_eq!(err, RendezvousError::Terminated);
    // The unwound receiver must not leave a stale pending flag behind.
    assert!(!channel.is_read_blocked());
    director.process_stopped(bystander);
}

#[test]
fn finish_unblocks_waiting_sender() {
    init_logging();
    let director = Director::new();
    let channel = Channel::new(&director);
    let p1 = director.process_started("sender");
    let bystander = director.process_started("bystander");

    let sender = {
        let channel = channel.clone();
        run_process(&director, p1, move |p| channel.send(p, Token::Unit))
    };
    wait_until(|| channel.is_write_blocked());

    director.request_finish();
    assert_eq!(
        sender.join().unwrap().unwrap_err(),
        RendezvousError::Terminated
    );
    assert!(!channel.is_write_blocked());
    director.process_stopped(bystander);
}
