pub mod copy;
pub mod ingest;
pub mod ledger;
pub mod store;
pub mod uploader;
