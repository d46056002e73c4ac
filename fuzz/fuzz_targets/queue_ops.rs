#![no_main]

//! Random push/pop/close sequences against the bounded queue.
//! The queue must never exceed its capacity and must never lose a task.

use arbitrary::Arbitrary;
use lazy_batch::engine::TaskQueue;
use lazy_batch::{ConversionOptions, Task};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum Op {
    TryPush,
    TryPop,
    Close,
    Drain,
}

#[derive(Arbitrary, Debug)]
struct Input {
    capacity: u8,
    ops: Vec<Op>,
}

fuzz_target!(|input: Input| {
    let capacity = (input.capacity as usize % 16) + 1;
    let queue = TaskQueue::new(capacity);
    let mut pushed = 0usize;
    let mut taken = 0usize;

    for op in input.ops.into_iter().take(512) {
        match op {
            Op::TryPush => {
                let task = Task::new("in.heic", "out.jpg", ConversionOptions::default());
                if queue.try_push(task).is_ok() {
                    pushed += 1;
                }
            }
            Op::TryPop => {
                if queue.try_pop().is_some() {
                    taken += 1;
                }
            }
            Op::Close => queue.close(),
            Op::Drain => taken += queue.drain().len(),
        }
        assert!(queue.len() <= capacity);
        assert_eq!(pushed - taken, queue.len());
    }
    assert!(queue.high_water() <= capacity);
});
