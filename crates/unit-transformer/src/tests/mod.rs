mod common;
mod transformer_scenarios;
