#[tokio::main]
async fn main() {
    if let Err(e) = scomm_lib::main_entry().await {
        eprintln!("scomm: {}", e);
        std::process::exit(1);
    }
}
