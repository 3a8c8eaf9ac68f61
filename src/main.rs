fn main() {
    if let Err(err) = schema_sync::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
