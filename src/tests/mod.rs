mod migration;
mod retrieval;
pub(crate) mod support;
