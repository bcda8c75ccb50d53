/// Split captured command output into non-empty lines on `\n` or `\r`.
pub fn split_lines(buffer: &[u8]) -> Vec<String> {
    buffer
        .split(|x: &u8| *x == b'\n' || *x == b'\r')
        .filter(|x| !x.is_empty())
        .map(|x| String::from_utf8_lossy(x).into_owned())
        .collect()
}
