#![cfg(feature = "loom")]

use loom::thread;
use xsync::{RingBuffer, TripleBuffer};

#[test]
fn test_ring_two_producers_loom() {
    loom::model(|| {
        let (producer, mut consumer) = RingBuffer::new(8).split();
        let p1 = producer.clone();
        let p2 = producer;

        let t1 = thread::spawn(move || assert!(p1.write(&[1, 1])));
        let t2 = thread::spawn(move || assert!(p2.write(&[2, 2])));

        // Whatever the consumer sees must be whole records
        let mut stream = consumer.read(4);
        t1.join().unwrap();
        t2.join().unwrap();
        stream.extend(consumer.read(4));

        assert_eq!(stream.len(), 4);
        assert_eq!(stream[0], stream[1]);
        assert_eq!(stream[2], stream[3]);
        assert_ne!(stream[0], stream[2]);
    });
}

#[test]
fn test_triple_flush_races_writer_loom() {
    loom::model(|| {
        let (writer, mut flusher) = TripleBuffer::new(4).split();

        let t = thread::spawn(move || assert!(writer.write(2, |dst| dst.copy_from_slice(&[7, 7]))));

        // The flush may run before, during or after the write; it never sees a
        // half-filled range
        let mut drained = Vec::new();
        flusher.flush(|batch| drained.extend_from_slice(batch));
        t.join().unwrap();

        for _ in 0..xsync::core::SLOTS + 1 {
            flusher.flush(|batch| drained.extend_from_slice(batch));
        }
        assert_eq!(drained, vec![7, 7]);
    });
}
