use node_agent_common::RemoteHostServiceClient;
use tarpc::{client, tokio_serde::formats::Json};
use tokio::net::ToSocketAddrs;

pub async fn build_client<A>(socket_addr: A) -> anyhow::Result<RemoteHostServiceClient>
where
    A: ToSocketAddrs,
{
    let mut transport = tarpc::serde_transport::tcp::connect(socket_addr, Json::default);
    transport.config_mut().max_frame_length(usize::MAX);

    let client = RemoteHostServiceClient::new(client::Config::default(), transport.await?).spawn();

    Ok(client)
}
