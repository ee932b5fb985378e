//! End-to-end single-thread scenarios, run against every region kind the
//! platform offers. The double-mapped arm and the heap/mirror arm must be
//! observationally identical.

use galena_mmap::AllocatorKind;
use galena_ring::{BufferConfig, StreamBuffer};

fn allocator_kinds() -> Vec<AllocatorKind> {
    #[cfg(target_os = "linux")]
    return vec![AllocatorKind::Heap, AllocatorKind::DoubleMapped];
    #[cfg(not(target_os = "linux"))]
    return vec![AllocatorKind::Heap];
}

fn buffer_with(kind: AllocatorKind, min_size: usize) -> StreamBuffer<i32> {
    StreamBuffer::new(BufferConfig::new(min_size).allocator(kind))
        .expect("buffer construction failed")
}

#[test]
fn basic_spsc_roundtrip() {
    for kind in allocator_kinds() {
        let buffer = buffer_with(kind, 1024);
        let mut writer = buffer.new_writer();
        let mut reader = buffer.new_reader();

        for value in 1..=10 {
            writer.publish(|span| span.fill(value), 1);
        }

        assert_eq!(reader.available(), 10);
        assert_eq!(reader.get(0), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert!(reader.consume(10));
        assert_eq!(reader.available(), 0);
    }
}

#[test]
fn fill_and_drain() {
    for kind in allocator_kinds() {
        let buffer = buffer_with(kind, 1024);
        let size = buffer.size();
        let mut writer = buffer.new_writer();
        let mut reader = buffer.new_reader();

        assert_eq!(writer.available(), size);
        writer.publish(
            |span| {
                for (i, v) in span.iter_mut().enumerate() {
                    *v = i as i32 + 1;
                }
            },
            size,
        );

        assert_eq!(writer.available(), 0);
        assert_eq!(reader.available(), size);
        assert_eq!(reader.get(1).len(), 1);
        assert!(!writer.try_publish(|span| span.fill(0), 1));

        let full = reader.get(0);
        assert_eq!(full.len(), size);
        assert_eq!(full[0], 1);
        assert_eq!(full[size - 1], size as i32);

        assert!(reader.consume(size));
        assert_eq!(reader.available(), 0);
        assert_eq!(writer.available(), size);
    }
}

#[test]
fn wrap_around_all_block_sizes() {
    for kind in allocator_kinds() {
        let buffer = buffer_with(kind, 1024);
        let size = buffer.size();
        let mut writer = buffer.new_writer();
        let mut reader = buffer.new_reader();

        let mut counter: i32 = 0;
        for block in [1usize, 2, 3, 5, 7, 42] {
            for _ in 0..size {
                counter += block as i32;
                let base = counter;
                assert!(writer.try_publish(
                    |span| {
                        for (i, v) in span.iter_mut().enumerate() {
                            *v = base + i as i32;
                        }
                    },
                    block
                ));

                let readable = reader.get(0);
                assert_eq!(readable.len(), block);
                assert_eq!(readable[0], base);
                assert_eq!(readable[block - 1], base + block as i32 - 1);
                assert!(reader.consume(block));
            }
        }
    }
}

#[test]
fn late_joining_reader_sees_only_later_samples() {
    for kind in allocator_kinds() {
        let buffer = buffer_with(kind, 1024);
        let mut writer = buffer.new_writer();
        let mut early = buffer.new_reader();

        writer.publish(
            |span| {
                for (i, v) in span.iter_mut().enumerate() {
                    *v = 10 + i as i32;
                }
            },
            10,
        );

        let mut late = buffer.new_reader();
        assert_eq!(late.available(), 0);

        writer.publish(
            |span| {
                for (i, v) in span.iter_mut().enumerate() {
                    *v = 100 + i as i32;
                }
            },
            5,
        );

        assert_eq!(late.available(), 5);
        assert_eq!(late.get(0), &[100, 101, 102, 103, 104]);
        assert!(late.consume(5));

        assert_eq!(early.available(), 15);
        assert!(early.consume(15));
    }
}

#[test]
fn dropping_a_reader_releases_its_slot() {
    for kind in allocator_kinds() {
        let buffer = buffer_with(kind, 1024);
        let mut writer = buffer.new_writer();

        {
            let _scoped = buffer.new_reader();
            assert_eq!(buffer.n_readers(), 1);
            writer.publish(|span| span.fill(1), 4);
        }
        assert_eq!(buffer.n_readers(), 0);

        let reader = buffer.new_reader();
        assert_eq!(buffer.n_readers(), 1);
        assert_eq!(reader.available(), 0);
    }
}

#[test]
fn dropping_the_slow_reader_unblocks_the_writer() {
    for kind in allocator_kinds() {
        let buffer = buffer_with(kind, 1024);
        let size = buffer.size();
        let mut writer = buffer.new_writer();
        let mut fast = buffer.new_reader();
        let slow = buffer.new_reader();
        assert_eq!(buffer.n_readers(), 2);

        writer.publish(|span| span.fill(1), size);
        assert!(fast.consume(size));

        // The ring is still full from the slow reader's point of view.
        assert!(!writer.try_publish(|span| span.fill(2), 1));

        let blocked = std::thread::spawn(move || {
            writer.publish(|span| span.fill(2), 1);
            writer
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!blocked.is_finished());

        drop(slow);
        let writer = blocked.join().expect("writer thread panicked");
        assert_eq!(buffer.n_readers(), 1);

        assert_eq!(fast.available(), 1);
        assert_eq!(fast.get(0), &[2]);
        assert_eq!(writer.available() + fast.available(), size);
    }
}
