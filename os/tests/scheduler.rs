// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dispatch order, sleeping, suspension and resource limits, driven on the
//! host with a simulated tick.

use core::cell::RefCell;
use core::convert::Infallible;
use core::future::{pending, Pending};
use core::pin::{pin, Pin};

use cadence::exec::{yield_cpu, MAX_TASKS};
use cadence::{
    Channel, Config, Error, Priority, Scheduler, TaskState, TickTime, Ticks, Timeout,
};

/// Task body that records its name every time it runs, yielding in between.
async fn chatter(name: &'static str, log: &RefCell<Vec<&'static str>>) -> Infallible {
    loop {
        log.borrow_mut().push(name);
        yield_cpu().await;
    }
}

#[test]
fn test_equal_priorities_round_robin_in_creation_order() {
    let mut sched = Scheduler::new(Config::DEFAULT).unwrap();
    let log = RefCell::new(Vec::new());
    let a = pin!(chatter("a", &log));
    let b = pin!(chatter("b", &log));
    let c = pin!(chatter("c", &log));
    sched.create_task(a, "a", 64, Priority::DEFAULT).unwrap();
    sched.create_task(b, "b", 64, Priority::DEFAULT).unwrap();
    sched.create_task(c, "c", 64, Priority::DEFAULT).unwrap();

    for _ in 0..7 {
        sched.dispatch().unwrap();
    }
    assert_eq!(*log.borrow(), ["a", "b", "c", "a", "b", "c", "a"]);
    assert_eq!(sched.stats().dispatches, 7);
    assert_eq!(sched.stats().context_switches, 7);
}

#[test]
fn test_more_urgent_task_runs_first() {
    let mut sched = Scheduler::new(Config::DEFAULT).unwrap();
    let log = RefCell::new(Vec::new());
    let low = pin!(async {
        log.borrow_mut().push("low");
        pending().await
    });
    let high = pin!(async {
        log.borrow_mut().push("high");
        pending().await
    });
    let lo = sched.create_task(low, "low", 64, Priority(3)).unwrap();
    let hi = sched.create_task(high, "high", 64, Priority::HIGHEST).unwrap();

    assert_eq!(sched.dispatch(), Some(hi));
    assert_eq!(sched.dispatch(), Some(lo));
    assert_eq!(sched.dispatch(), None);
    assert_eq!(*log.borrow(), ["high", "low"]);
}

#[test]
fn test_woken_task_runs_at_next_decision() {
    let mut sched = Scheduler::new(Config::DEFAULT).unwrap();
    let k = sched.kernel();
    let ch: Channel<u32, 4> = Channel::new();
    let log = RefCell::new(Vec::new());

    let consumer = pin!(async {
        let rx = ch.receiver(k);
        loop {
            let v = rx.receive(Timeout::Forever).await.unwrap();
            log.borrow_mut().push(format!("got {v}"));
        }
    });
    let producer = pin!(async {
        let tx = ch.sender(k);
        for i in 0.. {
            tx.send(i, Timeout::Forever).await.unwrap();
            log.borrow_mut().push(format!("sent {i}"));
            yield_cpu().await;
        }
        unreachable!()
    });
    sched.create_task(consumer, "consumer", 64, Priority::HIGHEST).unwrap();
    sched.create_task(producer, "producer", 64, Priority::DEFAULT).unwrap();

    for _ in 0..5 {
        sched.dispatch().unwrap();
    }
    assert_eq!(*log.borrow(), ["sent 0", "got 0", "sent 1", "got 1"]);
}

#[test]
fn test_sleepers_wake_at_their_deadline() {
    let mut sched = Scheduler::new(Config::DEFAULT).unwrap();
    let k = sched.kernel();
    let woke = RefCell::new(Vec::new());
    let sleeper = pin!(async {
        loop {
            k.sleep_for(Ticks(5)).await;
            woke.borrow_mut().push(k.now().ticks_since_boot());
        }
    });
    let h = sched.create_task(sleeper, "sleeper", 64, Priority::DEFAULT).unwrap();

    sched.run_until_idle();
    let info = sched.task_info(h);
    assert_eq!(info.state, TaskState::Blocked);
    assert_eq!(info.next_wake, Some(TickTime::from_ticks_since_boot(5)));

    sched.run_ticks(12);
    assert_eq!(*woke.borrow(), [5, 10]);
    assert_eq!(sched.task_info(h).polls, 3);
}

#[test]
fn test_sleep_until_past_deadline_returns_at_once() {
    let mut sched = Scheduler::new(Config::DEFAULT).unwrap();
    let k = sched.kernel();
    sched.run_ticks(10);
    let done = RefCell::new(false);
    let t = pin!(async {
        k.sleep_until(TickTime::from_ticks_since_boot(3)).await;
        *done.borrow_mut() = true;
        pending().await
    });
    sched.create_task(t, "late", 64, Priority::DEFAULT).unwrap();
    assert_eq!(sched.run_until_idle(), 1);
    assert!(*done.borrow());
}

#[test]
fn test_with_timeout_gives_up() {
    let mut sched = Scheduler::new(Config::DEFAULT).unwrap();
    let k = sched.kernel();
    let ch: Channel<u8, 1> = Channel::new();
    let result = RefCell::new(None);
    let t = pin!(async {
        let rx = ch.receiver(k);
        let r = k.with_timeout(Ticks(10), rx.receive(Timeout::Forever)).await;
        *result.borrow_mut() = Some((r, k.now().ticks_since_boot()));
        pending().await
    });
    sched.create_task(t, "impatient", 64, Priority::DEFAULT).unwrap();

    sched.run_ticks(20);
    assert_eq!(*result.borrow(), Some((None, 10)));
    // The abandoned receive left the queue, so the channel is usable.
    ch.try_send(1).unwrap();
    assert_eq!(ch.try_receive(), Ok(1));
}

#[test]
fn test_next_wake_forgets_a_timeout_resolved_early() {
    let mut sched = Scheduler::new(Config::DEFAULT).unwrap();
    let k = sched.kernel();
    let ch: Channel<u8, 1> = Channel::new();
    let got = RefCell::new(None);
    let t = pin!(async {
        let rx = ch.receiver(k);
        *got.borrow_mut() = Some(rx.receive(Timeout::ticks(100)).await);
        pending().await
    });
    let h = sched.create_task(t, "receiver", 64, Priority::DEFAULT).unwrap();

    sched.run_ticks(3);
    assert_eq!(sched.task_info(h).next_wake, Some(TickTime::from_ticks_since_boot(100)));

    ch.try_send(4).unwrap();
    sched.run_until_idle();
    assert_eq!(*got.borrow(), Some(Ok(4)));
    let info = sched.task_info(h);
    assert_eq!(info.state, TaskState::Blocked);
    assert_eq!(info.next_wake, None);

    // Nor does the stale deadline wake the task later.
    let polls = info.polls;
    sched.run_until(TickTime::from_ticks_since_boot(150));
    assert_eq!(sched.task_info(h).polls, polls);
}

#[test]
fn test_suspended_tasks_keep_their_wakeups() {
    let mut sched = Scheduler::new(Config::DEFAULT).unwrap();
    let log = RefCell::new(Vec::new());
    let t = pin!(chatter("t", &log));
    let h = sched.create_task(t, "t", 64, Priority::DEFAULT).unwrap();

    assert_eq!(sched.dispatch(), Some(h));
    sched.suspend(h);
    assert_eq!(sched.task_info(h).state, TaskState::Suspended);
    assert_eq!(sched.dispatch(), None);
    assert_eq!(sched.run_until_idle(), 0);

    sched.resume(h);
    assert_eq!(sched.task_info(h).state, TaskState::Ready);
    assert_eq!(sched.dispatch(), Some(h));
    assert_eq!(log.borrow().len(), 2);
}

#[test]
fn test_task_table_is_bounded() {
    let mut sched = Scheduler::new(Config::DEFAULT.with_stack_budget(usize::MAX)).unwrap();
    let mut parked: [Pending<Infallible>; MAX_TASKS + 1] = core::array::from_fn(|_| pending());
    let (fits, extra) = parked.split_at_mut(MAX_TASKS);

    for (i, p) in fits.iter_mut().enumerate() {
        let h = sched.create_task(Pin::<&mut Pending<Infallible>>::new(p), "parked", 1, Priority::DEFAULT).unwrap();
        assert_eq!(h.index(), i);
    }
    assert_eq!(
        sched.create_task(Pin::<&mut Pending<Infallible>>::new(&mut extra[0]), "one too many", 1, Priority::DEFAULT),
        Err(Error::ResourceExhausted),
    );
    assert_eq!(sched.task_count(), MAX_TASKS);
    assert_eq!(sched.run_until_idle(), MAX_TASKS);
}

#[test]
fn test_stack_reservations_cannot_overflow_the_budget() {
    let mut sched = Scheduler::new(Config::DEFAULT.with_stack_budget(1024)).unwrap();
    let mut a = pending::<Infallible>();
    let mut b = pending::<Infallible>();
    sched.create_task(Pin::<&mut Pending<Infallible>>::new(&mut a), "a", 1000, Priority::DEFAULT).unwrap();
    assert_eq!(
        sched.create_task(Pin::<&mut Pending<Infallible>>::new(&mut b), "b", usize::MAX, Priority::DEFAULT),
        Err(Error::ResourceExhausted),
    );
    assert_eq!(sched.stack_available(), 24);
}

#[test]
fn test_task_info_reports_creation_parameters() {
    let mut sched = Scheduler::new(Config::DEFAULT).unwrap();
    let mut p = pending::<Infallible>();
    let h = sched.create_task(Pin::<&mut Pending<Infallible>>::new(&mut p), "consumer", 512, Priority(7)).unwrap();
    let info = sched.task_info(h);
    assert_eq!(info.name, "consumer");
    assert_eq!(info.priority, Priority(7));
    assert_eq!(info.stack_size, 512);
    assert_eq!(info.state, TaskState::Ready);
    assert_eq!(info.next_wake, None);
    assert_eq!(info.polls, 0);
}
