//! Integration tests for the rill transport live under `tests/`.
