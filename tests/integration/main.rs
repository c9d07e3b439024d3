//! Integration tests: full cycles through the public API with a scripted
//! market and in-memory ledger.

mod mock_oracle;
mod simulation;
