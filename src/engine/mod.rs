pub mod compaction;
pub mod meta_service;
pub mod publish;
pub mod storage_engine;
pub mod tablet;
pub mod txn_manager;
