use std::env;

/// Command-line argument at position `pos`, if given.
pub fn take_from_args(pos: usize) -> Option<String> {
    env::args().nth(pos)
}
