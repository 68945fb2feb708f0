fn main() {
    if let Err(err) = pg_import::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
