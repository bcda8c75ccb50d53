mod lines;

pub use lines::split_lines;
