use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use sluice::error::SchedulerError;
use sluice::scheduler::{Scheduler, SchedulerDelegate, TracingDelegate};

#[derive(Clone, Default)]
struct Shared {
    errors: Arc<Mutex<Vec<String>>>,
    stopped: Arc<Mutex<bool>>,
}

impl SchedulerDelegate for Shared {
    fn on_task_error(&mut self, error: anyhow::Error) {
        self.errors.lock().unwrap().push(error.to_string());
    }

    fn on_stopped(&mut self) {
        *self.stopped.lock().unwrap() = true;
    }
}

#[test]
fn test_scheduler_runs_tasks_on_dispatch_thread_in_order() {
    let scheduler = Scheduler::<Vec<u32>>::new();
    let (tx, rx) = mpsc::channel();

    scheduler
        .start(|_handle| Vec::new(), TracingDelegate)
        .unwrap();

    for i in 0..100 {
        scheduler.post(move |log| {
            log.push(i);
            Ok(())
        });
    }
    scheduler.post(move |log| {
        let name = thread::current().name().map(str::to_string);
        tx.send((log.clone(), name)).unwrap();
        Ok(())
    });

    let (log, name) = rx.recv().unwrap();
    assert_eq!(log, (0..100).collect::<Vec<_>>());
    assert_eq!(name.as_deref(), Some("sluice-dispatch"));

    scheduler.stop();
    scheduler.join().unwrap();
}

#[test]
fn test_scheduler_posts_from_many_threads_each_in_order() {
    let scheduler = Scheduler::<Vec<(u32, u32)>>::new();
    scheduler.start(|_| Vec::new(), TracingDelegate).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let handle = scheduler.handle();
            thread::spawn(move || {
                for i in 0..50 {
                    handle.post(move |log| {
                        log.push((t, i));
                        Ok(())
                    });
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let (tx, rx) = mpsc::channel();
    scheduler.post(move |log| {
        tx.send(log.clone()).unwrap();
        Ok(())
    });
    let log = rx.recv().unwrap();

    assert_eq!(log.len(), 200);
    for t in 0..4 {
        let seen: Vec<u32> = log.iter().filter(|(w, _)| *w == t).map(|(_, i)| *i).collect();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    scheduler.stop();
    scheduler.join().unwrap();
}

#[test]
fn test_scheduler_failing_task_does_not_stop_the_loop() {
    let scheduler = Scheduler::<u32>::new();
    let delegate = Shared::default();
    scheduler.start(|_| 0, delegate.clone()).unwrap();

    scheduler.post(|_| Err(anyhow::anyhow!("first failed")));
    scheduler.post(|_| panic!("second panicked"));
    let (tx, rx) = mpsc::channel();
    scheduler.post(move |count| {
        *count += 1;
        tx.send(*count).unwrap();
        Ok(())
    });

    assert_eq!(rx.recv().unwrap(), 1);
    scheduler.stop();
    scheduler.join().unwrap();

    assert_eq!(
        *delegate.errors.lock().unwrap(),
        vec!["first failed".to_string(), "task panicked: second panicked".to_string()]
    );
    assert!(*delegate.stopped.lock().unwrap());
}

#[test]
fn test_scheduler_cannot_start_twice() {
    let scheduler = Scheduler::<()>::new();
    scheduler.start(|_| (), TracingDelegate).unwrap();

    let err = scheduler.start(|_| (), TracingDelegate).unwrap_err();
    assert!(matches!(err, SchedulerError::AlreadyStarted));

    let err = scheduler.run_until_idle(&mut (), &mut TracingDelegate).unwrap_err();
    assert!(matches!(err, SchedulerError::AlreadyStarted));

    scheduler.stop();
    scheduler.join().unwrap();
}

#[test]
fn test_scheduler_post_after_stop_is_dropped() {
    let scheduler = Scheduler::<()>::new();
    scheduler.start(|_| (), TracingDelegate).unwrap();
    let handle = scheduler.handle();

    scheduler.stop();
    scheduler.join().unwrap();

    assert!(!handle.post(|_| Ok(())));
}

#[test]
fn test_scheduler_join_without_start() {
    let scheduler = Scheduler::<()>::new();
    assert!(scheduler.join().is_ok());
}
