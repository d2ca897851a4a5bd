//! Streaming enumeration
//!
//! Pages through [`RecordStore::enumerate`] lazily, feeding the last key back
//! as the cursor. Dropping the stream stops paging.

use futures::stream::{self, BoxStream, StreamExt};
use membersys_core::{KeyedAgreement, Result};
use std::collections::VecDeque;

use crate::trait_::{EnumerateQuery, SharedStore};

/// Records fetched per backend call when none is given
pub const DEFAULT_BATCH_SIZE: usize = 100;

pub type RecordStream = BoxStream<'static, Result<KeyedAgreement>>;

struct Pager {
    store: SharedStore,
    query: EnumerateQuery,
    batch_size: usize,
    /// Records still to yield; `None` when unbounded
    remaining: Option<usize>,
    buffer: VecDeque<KeyedAgreement>,
    done: bool,
}

impl Pager {
    async fn next(mut self) -> Option<(Result<KeyedAgreement>, Self)> {
        loop {
            if self.remaining == Some(0) {
                return None;
            }
            if let Some(record) = self.buffer.pop_front() {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Some((Ok(record), self));
            }
            if self.done {
                return None;
            }

            let want = match self.remaining {
                Some(remaining) => remaining.min(self.batch_size),
                None => self.batch_size,
            };
            let page_query = self.query.clone().limit(want);
            match self.store.enumerate(&page_query).await {
                Ok(page) => {
                    self.done = page.len() < want;
                    if let Some(last) = page.last() {
                        self.query.start_cursor = last.key.clone();
                    }
                    self.buffer.extend(page);
                }
                Err(err) => {
                    self.done = true;
                    return Some((Err(err), self));
                }
            }
        }
    }
}

/// Stream the records matching `query`
///
/// `query.page_size` bounds the total number yielded (0 = all);
/// `batch_size` is the page size of each backend call. A backend failure is
/// yielded once as an `Err`, after which the stream ends.
pub fn enumerate_stream(store: SharedStore, query: EnumerateQuery, batch_size: usize) -> RecordStream {
    let pager = Pager {
        store,
        remaining: query.limit_opt(),
        query,
        batch_size: batch_size.max(1),
        buffer: VecDeque::new(),
        done: false,
    };
    stream::unfold(pager, Pager::next).boxed()
}

/// Collect every record of a stream, stopping at the first error
pub async fn collect_all(mut records: RecordStream) -> Result<Vec<KeyedAgreement>> {
    let mut all = Vec::new();
    while let Some(record) = records.next().await {
        all.push(record?);
    }
    Ok(all)
}
