pub mod catalog;
pub mod parse;
pub mod subst_model;
