pub mod driver;
pub mod index;
pub mod legality;
pub mod matchers;
pub mod pattern;
pub mod rewriter;
pub mod spec;
