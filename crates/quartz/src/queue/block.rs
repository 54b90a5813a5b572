//! Recorded command blocks.
//!
//! While recording, enqueued commands are collected instead of written to the ring. Ending the
//! recording copies them, followed by a `RET`, into heap RAM. Running a block enqueues a single
//! `CALL`, so replaying it costs two words of ring space regardless of its size.
use super::{Command, QueueError, Recording};
use crate::{Console, protocol::Kernel, system::sp::STACK_DEPTH};
use util::Address;

/// An immutable sequence of commands stored in RAM.
#[must_use = "blocks must be freed with free_block"]
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    pub(super) addr: Address,
    pub(super) words: u32,
    /// Call frames needed to run the block, its own included.
    pub(super) depth: usize,
}

impl Block {
    pub fn addr(&self) -> Address {
        self.addr
    }

    /// Length in words, the final `RET` included.
    pub fn words(&self) -> u32 {
        self.words
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Console {
    /// Starts recording a block. Commands enqueued from now on go into the block.
    #[track_caller]
    pub fn begin_block(&mut self) -> Result<(), QueueError> {
        self.check_crash()?;
        if self.queue.recording.is_some() {
            return Err(QueueError::AlreadyRecording);
        }

        self.queue.recording = Some(Recording {
            words: Vec::new(),
            callee_depth: 0,
        });

        Ok(())
    }

    /// Stops recording and stores the block in RAM.
    #[track_caller]
    pub fn end_block(&mut self) -> Result<Block, QueueError> {
        self.check_crash()?;
        let Some(mut recording) = self.queue.recording.take() else {
            return Err(QueueError::NotRecording);
        };

        let ret = Command::kernel(Kernel::Ret, 0, &[]);
        recording.words.extend_from_slice(ret.words());

        let bytes = recording.words.len() as u32 * 4;
        let Some(addr) = self.heap.alloc(bytes) else {
            return Err(QueueError::OutOfMemory(bytes));
        };

        for (i, word) in recording.words.iter().enumerate() {
            self.system.mem.write_u32(addr + i as u32 * 4, *word);
        }

        let block = Block {
            addr,
            words: recording.words.len() as u32,
            depth: recording.callee_depth + 1,
        };

        tracing::debug!(%addr, words = block.words, depth = block.depth, "recorded block");
        Ok(block)
    }

    /// Whether a block is being recorded.
    pub fn is_recording(&self) -> bool {
        self.queue.recording.is_some()
    }

    /// Enqueues a call to a block. While recording, the call is recorded instead, nesting the
    /// blocks.
    #[track_caller]
    pub fn run_block(&mut self, block: &Block) -> Result<(), QueueError> {
        self.check_crash()?;
        if let Some(recording) = &mut self.queue.recording {
            if block.depth + 1 > STACK_DEPTH {
                return Err(QueueError::BlockTooDeep);
            }

            recording.callee_depth = recording.callee_depth.max(block.depth);
        }

        self.enqueue_kernel(Command::kernel(Kernel::Call, 0, &[block.addr.value()]))
    }

    /// Frees a block once every call to it enqueued so far has run. Costs a syncpoint.
    #[track_caller]
    pub fn free_block(&mut self, block: Block) -> Result<(), QueueError> {
        if self.queue.recording.is_some() {
            return Err(QueueError::RecordingActive);
        }

        let id = self.new_syncpoint()?;
        self.queue.pending_frees.push_back((id, block.addr));

        Ok(())
    }

    /// Frees the blocks whose syncpoint has been reached.
    pub(crate) fn reclaim_blocks(&mut self) {
        let reached = self.system.sp.reached;
        while let Some(&(id, addr)) = self.queue.pending_frees.front() {
            if id.value() > reached {
                break;
            }

            self.queue.pending_frees.pop_front();
            self.heap.free(addr);
            tracing::trace!(%addr, "freed block");
        }
    }

    /// Blocks waiting for their syncpoint before being freed.
    pub fn pending_frees(&self) -> usize {
        self.queue.pending_frees.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{queue::test::console, ucode::accum::Accum};

    #[test]
    fn recording_state() {
        let mut console = console(256);
        assert!(matches!(console.end_block(), Err(QueueError::NotRecording)));

        console.begin_block().unwrap();
        assert!(console.is_recording());
        assert!(matches!(
            console.begin_block(),
            Err(QueueError::AlreadyRecording)
        ));
        assert!(matches!(
            console.new_syncpoint(),
            Err(QueueError::SyncpointInBlock)
        ));

        let block = console.end_block().unwrap();
        assert!(!console.is_recording());
        assert_eq!(block.words(), 1);
        assert_eq!(block.depth(), 1);
        console.free_block(block).unwrap();
    }

    #[test]
    fn replay_matches_direct_enqueue() {
        let accum = Accum::default();
        let commands = [
            accum.add(7),
            accum.add4([1, 2, 3]),
            accum.log(7),
            accum.high(100),
            accum.log(8),
            accum.add_many(&[10, 20, 30]).unwrap(),
        ];

        let mut direct = console(256);
        for _ in 0..3 {
            for command in &commands {
                direct.enqueue(command.clone()).unwrap();
            }
        }
        direct.sync().unwrap();

        let mut replayed = console(256);
        replayed.begin_block().unwrap();
        for command in &commands {
            replayed.enqueue(command.clone()).unwrap();
        }

        // nothing reaches the ring while recording
        assert!(replayed.is_idle());
        let block = replayed.end_block().unwrap();

        for _ in 0..3 {
            replayed.run_block(&block).unwrap();
        }
        replayed.sync().unwrap();

        assert_eq!(Accum::sum(&direct), Accum::sum(&replayed));
        assert_eq!(Accum::high_mark(&direct), Accum::high_mark(&replayed));
        assert_eq!(Accum::read_log(&direct), Accum::read_log(&replayed));
        assert_eq!(Accum::read_log(&replayed), vec![7, 8, 7, 8, 7, 8]);

        replayed.free_block(block).unwrap();
    }

    #[test]
    fn nested_blocks() {
        let accum = Accum::default();
        let mut console = console(256);

        console.begin_block().unwrap();
        console.enqueue(accum.log(1)).unwrap();
        let inner = console.end_block().unwrap();

        console.begin_block().unwrap();
        console.enqueue(accum.log(0)).unwrap();
        console.run_block(&inner).unwrap();
        console.run_block(&inner).unwrap();
        console.enqueue(accum.log(2)).unwrap();
        let outer = console.end_block().unwrap();
        assert_eq!(outer.depth(), 2);

        console.run_block(&outer).unwrap();
        console.enqueue(accum.log(3)).unwrap();
        console.sync().unwrap();

        assert_eq!(Accum::read_log(&console), vec![0, 1, 1, 2, 3]);
        assert!(console.system.sp.stack.is_empty());
    }

    #[test]
    fn nesting_is_limited_to_the_call_stack() {
        let mut console = console(256);

        console.begin_block().unwrap();
        let mut block = console.end_block().unwrap();
        for _ in 1..STACK_DEPTH {
            console.begin_block().unwrap();
            console.run_block(&block).unwrap();
            block = console.end_block().unwrap();
        }
        assert_eq!(block.depth(), STACK_DEPTH);

        console.begin_block().unwrap();
        assert!(matches!(
            console.run_block(&block),
            Err(QueueError::BlockTooDeep)
        ));
        let _ = console.end_block().unwrap();

        // the deepest allowed block still runs
        console.run_block(&block).unwrap();
        console.sync().unwrap();
        assert!(console.crash().is_none());
    }

    #[test]
    fn blocks_are_freed_after_their_last_use() {
        let accum = Accum::default();
        let mut console = console(256);
        let before = console.free_bytes();

        console.begin_block().unwrap();
        console.enqueue(accum.wait(5_000)).unwrap();
        console.enqueue(accum.add(1)).unwrap();
        let block = console.end_block().unwrap();
        assert!(console.free_bytes() < before);

        console.run_block(&block).unwrap();
        console.free_block(block).unwrap();
        assert_eq!(console.pending_frees(), 1);

        // still in use by the coprocessor
        console.poll();
        assert_eq!(console.pending_frees(), 1);
        assert!(console.free_bytes() < before);

        console.sync().unwrap();
        console.poll();
        assert_eq!(console.pending_frees(), 0);
        assert_eq!(console.free_bytes(), before);
        assert_eq!(Accum::sum(&console), 1);
    }
}
