fn main() {
    if !cfg!(unix) {
        panic!("{} only works on unix-like systems", env!("CARGO_PKG_NAME"));
    }
}
