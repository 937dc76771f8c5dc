//! ToUpper客户端示例：一个同步作业和一个后台作业
//!
//! 服务器列表取自`GEARMAN_SERVERS`(逗号分隔)，默认`127.0.0.1:4730`。

use std::env;
use std::time::Duration;

use gear_pool::{Client, ClientConfig, JobState};
use log::info;

#[tokio::main]
async fn main() -> gear_pool::Result<()> {
    env_logger::init();

    let servers: Vec<String> = env::var("GEARMAN_SERVERS")
        .unwrap_or_else(|_| "127.0.0.1:4730".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let mut client = Client::connect(ClientConfig::new(servers)).await?;

    let echoed = client.echo("ping").await?;
    info!("Echo: {}", String::from_utf8_lossy(&echoed));

    let result = client
        .do_job("ToUpper", "arbitrary binary data", Some(Duration::from_secs(5)))
        .await?;
    println!("{}", String::from_utf8_lossy(&result));

    let id = client.submit_background("ToUpper", "background data").await?;
    loop {
        let state = client.poll(id).await?;
        info!("{} is {:?}", id, state);
        if state.is_terminal() || state == JobState::Unknown {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    client.discard(id);
    client.close();
    Ok(())
}
