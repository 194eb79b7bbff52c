use nodeodm::Error;


#[tokio::main]
async fn main() -> Result<(), Error> {
    nodeodm::command::run().await
}
