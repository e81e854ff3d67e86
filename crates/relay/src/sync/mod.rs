pub mod doc_set;
pub mod peer;
pub mod repository;
