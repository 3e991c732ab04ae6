use std::error::Error;

use ensign_sdk::stream::proto::NackCode;
use ensign_sdk::{Client, Options};

fn main() -> Result<(), Box<dyn Error>> {
    let options = Options::from_env();
    let topics = ["REPLACE_WITH_TOPIC_NAME"];

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = Client::new(options).await?;
        let mut subscription = client.subscribe(&topics).await?;

        let mut received = 0usize;
        while let Some(event) = subscription.recv().await {
            let mut event = match event {
                Ok(event) => event,
                Err(err) => {
                    eprintln!("skipping undecodable event: {err}");
                    continue;
                }
            };

            received += 1;
            println!(
                "id={} topic={:?} data={}",
                event.id(),
                event.topic_id(),
                String::from_utf8_lossy(&event.data)
            );
            if event.data.is_empty() {
                event.nack(NackCode::Unprocessed).await?;
            } else {
                event.ack().await?;
            }

            if received >= 10 {
                break;
            }
        }

        subscription.close().await?;
        if let Some(err) = subscription.err() {
            eprintln!("subscription stopped: {err}");
        }
        Ok::<(), Box<dyn Error>>(())
    })
}
