use super::job::{Job, JobId};

/// Default entry budget shared by the ready and delay queues.
pub const DEFAULT_CAPACITY: usize = 16 << 20;

/// A binary min-heap of jobs.
///
/// The ordering key is computed by the caller at insertion time and stored
/// alongside the job; the two instantiations use `(pri, id)` for the ready
/// queue and `(deadline, id)` for the delay queue. Keys must end with the
/// job ID: IDs are assigned in creation order, so the tie-break makes jobs
/// with equal priority (or equal deadline) dequeue FIFO.
///
/// The heap itself does not enforce a bound. The two queue instances share
/// one capacity budget, and their owner checks the combined count before
/// any insert, so a bound here would double the effective limit.
#[derive(Debug)]
pub struct JobHeap<K: Ord + Copy> {
    slots: Vec<(K, Job)>,
}

impl<K: Ord + Copy> JobHeap<K> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Inserts a job.
    pub fn give(&mut self, key: K, job: Job) {
        self.slots.push((key, job));
        self.sift_up(self.slots.len() - 1);
    }

    /// Removes and returns the minimum job.
    pub fn take(&mut self) -> Option<Job> {
        if self.slots.is_empty() {
            return None;
        }

        let last = self.slots.len() - 1;
        self.slots.swap(0, last);
        // Panic safety: the heap is non-empty, so pop returns a value.
        let (_, job) = self.slots.pop().unwrap();
        if !self.slots.is_empty() {
            self.sift_down(0);
        }

        Some(job)
    }

    /// The minimum job, without removing it.
    pub fn peek(&self) -> Option<&Job> {
        self.slots.first().map(|(_, job)| job)
    }

    /// The minimum job's ordering key.
    pub fn peek_key(&self) -> Option<K> {
        self.slots.first().map(|(key, _)| *key)
    }

    /// Looks a job up by ID. A linear scan: only the peek-by-id path uses
    /// this, and it never runs in the matching loop.
    pub fn find(&self, id: JobId) -> Option<&Job> {
        self.slots.iter().find(|(_, job)| job.id == id).map(|(_, job)| job)
    }

    pub fn used(&self) -> usize {
        self.slots.len()
    }

    fn sift_up(&mut self, mut at: usize) {
        while at > 0 {
            let parent = (at - 1) / 2;
            if self.slots[parent].0 <= self.slots[at].0 {
                break;
            }
            self.slots.swap(parent, at);
            at = parent;
        }
    }

    fn sift_down(&mut self, mut at: usize) {
        loop {
            let left = 2 * at + 1;
            if left >= self.slots.len() {
                break;
            }

            let right = left + 1;
            let smaller = if right < self.slots.len()
                && self.slots[right].0 < self.slots[left].0
            {
                right
            } else {
                left
            };

            if self.slots[at].0 <= self.slots[smaller].0 {
                break;
            }
            self.slots.swap(at, smaller);
            at = smaller;
        }
    }
}
