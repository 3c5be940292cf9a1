use std::sync::Mutex;

/// Thread-safe circular buffer holding the most recent values.
///
/// When the buffer is full, a write overwrites the oldest value. Reads never
/// block; an empty buffer simply yields `None`. This is the only form of
/// backpressure between pipeline stages: under sustained overload the oldest
/// unconsumed items are lost.
pub struct RingBuffer<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    size: usize,
}

impl<T> RingBuffer<T> {
    /// Creates a buffer with the given fixed capacity.
    ///
    /// Panics if `capacity` is zero; a zero-capacity buffer cannot hold data
    /// and is a construction-time programmer error.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be greater than 0");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        RingBuffer {
            inner: Mutex::new(Inner {
                slots,
                head: 0,
                tail: 0,
                size: 0,
            }),
        }
    }

    /// Inserts a value. When the buffer is full the oldest value is dropped.
    pub fn write(&self, value: T) {
        let mut inner = self.inner.lock().expect("ring buffer lock poisoned");
        let capacity = inner.slots.len();
        if inner.size == capacity {
            // Advance the tail to overwrite the oldest entry.
            inner.tail = (inner.tail + 1) % capacity;
        } else {
            inner.size += 1;
        }
        let head = inner.head;
        inner.slots[head] = Some(value);
        inner.head = (head + 1) % capacity;
    }

    /// Removes and returns the oldest value, or `None` when empty.
    pub fn read(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("ring buffer lock poisoned");
        if inner.size == 0 {
            return None;
        }
        let tail = inner.tail;
        let value = inner.slots[tail].take();
        inner.tail = (tail + 1) % inner.slots.len();
        inner.size -= 1;
        value
    }

    /// Number of values currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("ring buffer lock poisoned").size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
