use console::style;
use durastream::start_server;
use tracing_subscriber::EnvFilter;

use crate::Context;

#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct RunCommand {
    /// Port to run the server on (overrides the manifest)
    #[arg(long, env = "DURASTREAM_PORT")]
    pub port: Option<u16>,

    /// Host to bind to (overrides the manifest)
    #[arg(long, env = "DURASTREAM_HOST")]
    pub host: Option<String>,

    /// Bearer token for the project admin routes
    #[arg(long, env = "DURASTREAM_ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// Default long-poll wait in milliseconds
    #[arg(long)]
    pub long_poll_timeout_ms: Option<u64>,
}

impl RunCommand {
    pub async fn execute(&self, ctx: &Context) -> anyhow::Result<()> {
        let mut options = ctx.manifest.options.clone();
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(host) = &self.host {
            options.host = host.clone();
        }
        if let Some(token) = &self.admin_token {
            options.admin_token = Some(token.clone());
        }
        if let Some(timeout) = self.long_poll_timeout_ms {
            options.long_poll_timeout_ms = timeout;
        }

        println!();
        println!("{}{}", style("dura").white(), style("stream").green());
        println!("{}", style("Starting durable streams server").dim());
        println!();

        let mode = if options.projects.is_empty() {
            "open (no projects configured)".to_string()
        } else {
            format!("{} projects", options.projects.len())
        };
        println!("{} {}", style("Mode").dim(), mode);
        println!("{} {}", style("Listen").dim(), options.bind_address());
        println!();

        println!("{}", style("Endpoints").dim());
        let base = format!("http://{}", options.bind_address());
        println!("  PUT|POST|GET|HEAD|DELETE {base}/v1/stream/{{id}}");
        println!("  POST {base}/v1/publish/{{id}}");
        println!("  POST|GET {base}/v1/subscribe/{{id}}");
        println!("  GET|DELETE {base}/v1/sessions/{{sid}}");
        println!("  GET {base}/health");
        println!();
        println!("{}", style("Press Ctrl+C to stop").dim());
        println!();

        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("info,durastream=info")),
            )
            .init();

        start_server(options).await?;
        Ok(())
    }
}
