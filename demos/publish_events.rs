use std::error::Error;

use ensign_sdk::stream::proto::MimeType;
use ensign_sdk::{Client, Event, Options};

fn main() -> Result<(), Box<dyn Error>> {
    // Credentials and endpoint come from ENSIGN_* variables when unset here.
    let options = Options::from_env();
    let topic = "REPLACE_WITH_TOPIC_NAME";

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = Client::new(options).await?;
        if !client.topic_exists(topic).await? {
            let topic_id = client.create_topic(topic).await?;
            println!("created topic {topic} id={topic_id}");
        }

        let mut events: Vec<Event> = (0..5)
            .map(|n| {
                Event::new(format!(r#"{{"n":{n}}}"#), MimeType::ApplicationJson)
                    .with_metadata("source", "publish_events")
            })
            .collect();
        client.publish(topic, &mut events).await?;

        for event in events.iter_mut() {
            if event.wait_for_reply().await? {
                println!("acked id={} offset={:?}", event.id(), event.offset());
            } else if let Some(nack) = event.rejection() {
                println!("nacked code={} error={:?}", nack.code, nack.error);
            }
        }

        client.close().await?;
        Ok::<(), Box<dyn Error>>(())
    })
}
