pub mod chunker;
pub mod epub;
pub mod ledger;
pub mod llm;
pub mod markup;
pub mod pipeline;
pub mod processor;
pub mod recap;
pub mod template;
