fn main() {
    let args: Vec<String> = std::env::args().collect();
    std::process::exit(origin_server::cli::run(&args));
}
