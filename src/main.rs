#[tokio::main]
async fn main() {
    if let Err(error) = campaign_advisor_lib::run().await {
        eprintln!("campaign-advisor: {}", error);
        std::process::exit(1);
    }
}
