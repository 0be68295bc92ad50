// Integration tests run against the in-memory broker unless marked #[ignore]

mod batch_test;
mod common;
mod connection_test;
mod dedup_test;
mod publisher_test;
mod stream_test;
mod worker_test;
