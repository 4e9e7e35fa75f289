/*!
stratadb is an embedded, ordered key-value store built on a log-structured
merge-tree.

Binary keys map to binary values. The store offers point reads, ordered
forward and backward range scans, consistent snapshots, and atomic batched
writes. Writes land in a write-ahead log and an in-memory table; background
work folds them into leveled, immutable sorted table files. After a crash,
recovery replays the durable files and exposes every acknowledged write.

# Example

```no_run
use stratadb::{Batch, DbOptions, ReadOptions, WriteOptions, DB};

let mut options = DbOptions::default();
options.create_if_missing = true;
let db = DB::open(options, "/tmp/stratadb-demo").unwrap();

db.put(WriteOptions::default(), b"radish", b"pickled").unwrap();
let value = db.get(ReadOptions::default(), b"radish").unwrap();
assert_eq!(value, b"pickled");

let mut batch = Batch::new();
batch.delete(b"radish");
batch.put(b"carrot", b"raw");
db.write(WriteOptions { sync: true }, batch).unwrap();
```
*/

pub mod comparator;
pub mod db;
pub mod filter_policy;
pub mod fs;
pub mod options;

mod batch;
mod compaction;
mod config;
mod errors;
mod file_names;
mod iterator;
mod key;
mod logs;
mod memtable;
mod snapshots;
mod table_cache;
mod tables;
mod utils;
mod versioning;
mod writers;

pub use batch::{Batch, BatchHandler};
pub use config::CompressionType;
pub use db::{DbIterator, DB};
pub use errors::{DbIoError, StrataError, StrataResult};
pub use options::{DbOptions, ReadOptions, WriteOptions};
pub use snapshots::Snapshot;
pub use tables::{Block, BlockCacheKey};
pub use utils::cache::{Cache, ShardedLruCache};
