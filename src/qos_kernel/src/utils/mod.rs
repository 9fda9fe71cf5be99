//! Utility
pub(crate) mod intrusive_list;
