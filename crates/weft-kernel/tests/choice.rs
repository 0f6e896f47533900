//! Nondeterministic choice (ALT) tests.

mod common;

use std::sync::mpsc;

use common::{init_logging, run_process, wait_until};
use weft_kernel::{
    Channel, ChoiceController, Director, GuardedBranch, RendezvousError, Token,
};

#[test]
fn no_guard_true_returns_none_without_blocking() {
    init_logging();
    let director = Director::new();
    let channel = Channel::new(&director);
    let p1 = director.process_started("chooser");

    let chooser = {
        let director2 = director.clone();
        let channel = channel.clone();
        run_process(&director, p1, move |p| {
            let mut ctrl = ChoiceController::new(&director2);
            let mut branches = [
                GuardedBranch::send(0, false, &channel, Token::Int(1)),
                GuardedBranch::receive(1, false, &channel),
            ];
            assert_eq!(ctrl.choose(p, &mut branches)?, None);
            Ok(())
        })
    };
    chooser.join().unwrap().unwrap();
}

#[test]
fn duplicate_branch_ids_are_rejected() {
    init_logging();
    let director = Director::new();
    let channel = Channel::new(&director);
    let p1 = director.process_started("chooser");

    let chooser = {
        let director2 = director.clone();
        let channel = channel.clone();
        run_process(&director, p1, move |p| {
            let mut ctrl = ChoiceController::new(&director2);
            let mut branches = [
                GuardedBranch::send(3, true, &channel, Token::Int(1)),
                GuardedBranch::receive(3, true, &channel),
            ];
            match ctrl.choose(p, &mut branches) {
                Err(RendezvousError::DuplicateBranch(3)) => Ok(()),
                other => panic!("expected duplicate-branch error, got {:?}", other.map(|_| ())),
            }
        })
    };
    chooser.join().unwrap().unwrap();
}

#[test]
fn single_enabled_branch_runs_direct() {
    init_logging();
    let director = Director::new();
    let channel = Channel::new(&director);
    let p1 = director.process_started("chooser");
    let p2 = director.process_started("partner");

    let (tx, rx) = mpsc::channel();
    let chooser = {
        let director2 = director.clone();
        let channel = channel.clone();
        run_process(&director, p1, move |p| {
            let mut ctrl = ChoiceController::new(&director2);
            let mut branches = [
                GuardedBranch::send(0, false, &channel, Token::Int(1)),
                GuardedBranch::receive(1, true, &channel),
            ];
            let winner = ctrl.choose(p, &mut branches)?;
            assert_eq!(winner, Some(1));
            tx.send(branches[1].take_value()).unwrap();
            Ok(())
        })
    };
    let partner = {
        let channel = channel.clone();
        run_process(&director, p2, move |p| channel.send(p, Token::Int(42)))
    };

    chooser.join().unwrap().unwrap();
    partner.join().unwrap().unwrap();
    assert_eq!(rx.recv().unwrap(), Some(Token::Int(42)));
}

#[test]
fn send_branch_wins_when_partner_receives_its_channel() {
    init_logging();
    let director = Director::new();
    let c1 = Channel::new(&director);
    let c2 = Channel::new(&director);
    let p1 = director.process_started("chooser");
    let p2 = director.process_started("partner");

    let chooser = {
        let director2 = director.clone();
        let c1 = c1.clone();
        let c2 = c2.clone();
        run_process(&director, p1, move |p| {
            let mut ctrl = ChoiceController::new(&director2);
            let mut branches = [
                GuardedBranch::send(0, true, &c1, Token::Int(1)),
                GuardedBranch::receive(1, true, &c2),
            ];
            assert_eq!(ctrl.choose(p, &mut branches)?, Some(0));
            Ok(())
        })
    };
    let partner = {
        let c1 = c1.clone();
        run_process(&director, p2, move |p| {
            assert_eq!(c1.receive(p)?, Token::Int(1));
            Ok(())
        })
    };

    chooser.join().unwrap().unwrap();
    partner.join().unwrap().unwrap();
    // The losing receive branch must have withdrawn its offer.
    assert!(!c2.is_read_blocked());
}

#[test]
fn exactly_one_branch_wins_with_two_ready_partners() {
    init_logging();
    let director = Director::new();
    let c1 = Channel::new(&director);
    let c2 = Channel::new(&director);
    let p1 = director.process_started("chooser");
    let p2 = director.process_started("s1");
    let p3 = director.process_started("s2");

    let s1 = {
        let c1 = c1.clone();
        run_process(&director, p2, move |p| c1.send(p, Token::Int(10)))
    };
    let s2 = {
        let c2 = c2.clone();
        run_process(&director, p3, move |p| c2.send(p, Token::Int(20)))
    };

    let chooser = {
        let director2 = director.clone();
        let c1 = c1.clone();
        let c2 = c2.clone();
        run_process(&director, p1, move |p| {
            let mut ctrl = ChoiceController::new(&director2);
            let mut branches = [
                GuardedBranch::receive(0, true, &c1),
                GuardedBranch::receive(1, true, &c2),
            ];
            let winner = ctrl.choose(p, &mut branches)?.expect("some branch wins");
            let value = branches[winner].take_value().expect("winner took a token");
            match winner {
                0 => assert_eq!(value, Token::Int(10)),
                1 => assert_eq!(value, Token::Int(20)),
                other => panic!("unexpected winner {}", other),
            }
            // Drain the loser's sender so it can finish too.
            let loser = if winner == 0 { &c2 } else { &c1 };
            loser.receive(p)?;
            Ok(())
        })
    };

    chooser.join().unwrap().unwrap();
    s1.join().unwrap().unwrap();
    s2.join().unwrap().unwrap();
    assert_eq!(director.blocked_count(), 0);
}

#[test]
fn mutual_conditional_choices_commit_exactly_one_channel() {
    init_logging();
    let director = Director::new();
    let c1 = Channel::new(&director);
    let c2 = Channel::new(&director);
    let p1 = director.process_started("left");
    let p2 = director.process_started("right");

    let (tx1, rx1) = mpsc::channel();
    let (tx2, rx2) = mpsc::channel();

    let left = {
        let director2 = director.clone();
        let c1 = c1.clone();
        let c2 = c2.clone();
        run_process(&director, p1, move |p| {
            let mut ctrl = ChoiceController::new(&director2);
            let mut branches = [
                GuardedBranch::send(0, true, &c1, Token::Int(7)),
                GuardedBranch::receive(1, true, &c2),
            ];
            let winner = ctrl.choose(p, &mut branches)?.expect("some branch wins");
            tx1.send((winner, branches[winner].take_value())).unwrap();
            Ok(())
        })
    };
    let right = {
        let director2 = director.clone();
        let c1 = c1.clone();
        let c2 = c2.clone();
        run_process(&director, p2, move |p| {
            let mut ctrl = ChoiceController::new(&director2);
            let mut branches = [
                GuardedBranch::receive(0, true, &c1),
                GuardedBranch::send(1, true, &c2, Token::Int(8)),
            ];
            let winner = ctrl.choose(p, &mut branches)?.expect("some branch wins");
            tx2.send((winner, branches[winner].take_value())).unwrap();
            Ok(())
        })
    };

    left.join().unwrap().unwrap();
    right.join().unwrap().unwrap();
    let (w1, v1) = rx1.recv().unwrap();
    let (w2, v2) = rx2.recv().unwrap();
    // Both sides must agree on which channel the pair resolved to: the
    // two commits only happen when both first-trying claims held at once.
    assert_eq!(w1, w2, "both controllers must pick the same channel");
    match w1 {
        0 => {
            // C1 transferred: left sent 7, right received it.
            assert_eq!(v2, Some(Token::Int(7)));
        }
        1 => {
            // C2 transferred: right sent 8, left received it.
            assert_eq!(v1, Some(Token::Int(8)));
        }
        other => panic!("unexpected winner {}", other),
    }
    assert!(!c1.is_read_blocked() && !c1.is_write_blocked());
    assert!(!c2.is_read_blocked() && !c2.is_write_blocked());
}

#[test]
fn multicast_send_branch_transfers_every_target() {
    init_logging();
    let director = Director::new();
    let c1 = Channel::new(&director);
    let c2 = Channel::new(&director);
    let c3 = Channel::new(&director);
    let p1 = director.process_started("chooser");
    let p2 = director.process_started("r1");
    let p3 = director.process_started("r2");

    let r1 = {
        let c1 = c1.clone();
        run_process(&director, p2, move |p| {
            assert_eq!(c1.receive(p)?, Token::Int(9));
            Ok(())
        })
    };
    let r2 = {
        let c2 = c2.clone();
        run_process(&director, p3, move |p| {
            assert_eq!(c2.receive(p)?, Token::Int(9));
            Ok(())
        })
    };

    let chooser = {
        let director2 = director.clone();
        let c1 = c1.clone();
        let c2 = c2.clone();
        let c3 = c3.clone();
        run_process(&director, p1, move |p| {
            let mut ctrl = ChoiceController::new(&director2);
            let mut branches = [
                GuardedBranch::send_to_all(0, true, &[c1, c2], Token::Int(9)),
                // No partner ever arrives on c3.
                GuardedBranch::receive(1, true, &c3),
            ];
            assert_eq!(ctrl.choose(p, &mut branches)?, Some(0));
            Ok(())
        })
    };

    chooser.join().unwrap().unwrap();
    r1.join().unwrap().unwrap();
    r2.join().unwrap().unwrap();
    assert!(!c3.is_read_blocked());
}

#[test]
fn choice_aborts_on_finish() {
    init_logging();
    let director = Director::new();
    let c1 = Channel::new(&director);
    let c2 = Channel::new(&director);
    let p1 = director.process_started("chooser");
    let bystander = director.process_started("bystander");

    let chooser = {
        let director2 = director.clone();
        let c1 = c1.clone();
        let c2 = c2.clone();
        run_process(&director, p1, move |p| {
            let mut ctrl = ChoiceController::new(&director2);
            let mut branches = [
                GuardedBranch::receive(0, true, &c1),
                GuardedBranch::receive(1, true, &c2),
            ];
            ctrl.choose(p, &mut branches).map(|_| ())
        })
    };
    wait_until(|| c1.is_read_blocked() && c2.is_read_blocked());

    director.request_finish();
    assert_eq!(
        chooser.join().unwrap().unwrap_err(),
        RendezvousError::Terminated
    );
    assert!(!c1.is_read_blocked() && !c2.is_read_blocked());
    director.process_stopped(bystander);
}
