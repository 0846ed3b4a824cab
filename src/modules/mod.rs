pub mod backing_store;
