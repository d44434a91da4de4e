// Integration tests live in this directory rather than in a top-level
// `tests/` crate so they can exercise crate-internal types directly
// (`StreamTransport`, `AuthEngine`, `VecLoader`) without a public surface
// just for testing. Mirrors the teacher crate's `src/tests/` layout.

mod common;
mod scenarios_test;
mod transport_test;
