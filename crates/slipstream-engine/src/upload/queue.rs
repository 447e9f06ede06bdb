//! Waiting-user queue
//!
//! Users refused a slot wait here in arrival order, together with the files
//! they asked for and the connection token needed to call them back. The
//! reported queue position is 1-based.

use slipstream_core::{Cid, HintedUser};

/// One file a waiting user asked for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadQueueItem {
    pub file: String,
    pub pos: i64,
    pub size: i64,
}

/// A user waiting for a slot
#[derive(Clone, Debug)]
pub struct WaitingUser {
    pub user: HintedUser,
    pub token: String,
    pub files: Vec<UploadQueueItem>,
}

/// FIFO of waiting users; guarded by the dispatcher lock
#[derive(Default)]
pub struct UploadQueue {
    waiting: Vec<WaitingUser>,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a refused request; returns the user's 1-based queue position
    pub fn add(
        &mut self,
        user: HintedUser,
        token: String,
        file: String,
        pos: i64,
        size: i64,
    ) -> usize {
        if let Some(index) = self.position_of(&user.cid) {
            let entry = &mut self.waiting[index];
            entry.token = token;
            match entry.files.iter_mut().find(|f| f.file == file) {
                Some(existing) => existing.pos = pos,
                None => entry.files.push(UploadQueueItem { file, pos, size }),
            }
            return index + 1;
        }

        self.waiting.push(WaitingUser {
            user,
            token,
            files: vec![UploadQueueItem { file, pos, size }],
        });
        self.waiting.len()
    }

    /// 0-based index of a waiting user
    pub fn position_of(&self, cid: &Cid) -> Option<usize> {
        self.waiting.iter().position(|w| w.user.cid == *cid)
    }

    /// Drop a user's entry; true if one existed
    pub fn remove_user(&mut self, cid: &Cid) -> bool {
        match self.position_of(cid) {
            Some(index) => {
                self.waiting.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn front(&self) -> Option<&WaitingUser> {
        self.waiting.first()
    }

    pub fn pop_front(&mut self) -> Option<WaitingUser> {
        if self.waiting.is_empty() {
            None
        } else {
            Some(self.waiting.remove(0))
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn snapshot(&self) -> Vec<WaitingUser> {
        self.waiting.clone()
    }
}
