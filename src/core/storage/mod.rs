pub mod btree;
pub mod pager;

pub use btree::BTree;
pub use pager::{Pager, PAGE_SIZE};
