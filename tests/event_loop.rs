mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use hive_io::EventLoopThread;

use common::wait_until;

#[test]
fn task_runs_exactly_once_on_the_loop_thread() {
    let loop_thread = EventLoopThread::spawn(|_| {}).unwrap();
    let handle = loop_thread.handle();

    let count = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    let c = Arc::clone(&count);
    handle.run_in_loop(move || {
        c.fetch_add(1, Ordering::SeqCst);
        tx.send(thread::current().id()).unwrap();
    });

    let executed_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(executed_on, thread::current().id());

    // give an accidental re-execution a moment to surface
    thread::sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::SeqCst), 1);

    loop_thread.shutdown();
}

#[test]
fn queue_in_loop_wakes_a_blocked_poll() {
    let loop_thread = EventLoopThread::spawn(|_| {}).unwrap();
    let handle = loop_thread.handle();

    // let the loop settle into its poll
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    let (tx, rx) = mpsc::channel();
    handle.queue_in_loop(move || {
        tx.send(()).unwrap();
    });

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // the loop's poll timeout is far larger than this bound, so getting
    // here quickly proves the wakeup fired
    assert!(start.elapsed() < Duration::from_secs(2));

    loop_thread.shutdown();
}

#[test]
fn run_in_loop_is_synchronous_on_the_loop_thread() {
    let (tx, rx) = mpsc::channel();

    let loop_thread = EventLoopThread::spawn(move |event_loop| {
        let flag = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flag);
        event_loop.run_in_loop(move || f.store(true, Ordering::SeqCst));
        // executed before run_in_loop returned, not queued
        tx.send(flag.load(Ordering::SeqCst)).unwrap();
    })
    .unwrap();

    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

    loop_thread.shutdown();
}

#[test]
fn quit_from_a_foreign_thread_stops_the_loop_promptly() {
    let loop_thread = EventLoopThread::spawn(|_| {}).unwrap();

    thread::sleep(Duration::from_millis(20));

    let start = Instant::now();
    loop_thread.shutdown();
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn affinity_assert_panics_on_a_foreign_thread() {
    let loop_thread = EventLoopThread::spawn(|_| {}).unwrap();
    let handle = loop_thread.handle();

    let result = thread::spawn(move || handle.assert_in_loop_thread()).join();
    assert!(result.is_err());

    loop_thread.shutdown();
}

#[test]
fn affinity_holds_on_the_loop_thread() {
    let (tx, rx) = mpsc::channel();

    let loop_thread = EventLoopThread::spawn(move |event_loop| {
        event_loop.assert_in_loop_thread();
        assert!(event_loop.is_in_loop_thread());
        tx.send(()).unwrap();
    })
    .unwrap();

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    loop_thread.shutdown();
}

#[test]
fn tasks_from_many_threads_all_execute() {
    let loop_thread = EventLoopThread::spawn(|_| {}).unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    let mut posters = Vec::new();
    for _ in 0..8 {
        let handle = loop_thread.handle();
        let count = Arc::clone(&count);
        posters.push(thread::spawn(move || {
            for _ in 0..100 {
                let c = Arc::clone(&count);
                handle.run_in_loop(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                });
            }
        }));
    }

    for poster in posters {
        poster.join().unwrap();
    }

    assert!(wait_until(|| count.load(Ordering::SeqCst) == 800));

    loop_thread.shutdown();
}
