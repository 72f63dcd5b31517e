use std::{path::Path, sync::Arc, time::Duration, time::Instant};

use clap::Parser;
use error::AppError;
use httpcache_engine::{
    CacheConfig, HttpCache, HttpRequest, LoadFlags, NetworkConfig, ProxyConfig, RequestPriority,
    ReqwestNetworkLayer,
};
use tokio::io::AsyncWriteExt;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;
use url::Url;

mod cli;
mod error;
mod headers;

use cli::CliArgs;

/// Read buffer handed to the cache transaction
const READ_BUFFER_SIZE: usize = 64 * 1024;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    info!(
        "HTTP timeout configuration: overall={}s, connect={}s, read={}s",
        args.timeout, args.connect_timeout, args.read_timeout
    );

    let mut network_config = NetworkConfig::builder()
        .with_timeout(Duration::from_secs(args.timeout))
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_read_timeout(Duration::from_secs(args.read_timeout));

    network_config = if args.no_proxy {
        info!("All proxy settings disabled (--no-proxy flag)");
        network_config.with_system_proxy(false)
    } else if let Some(proxy_url) = args.proxy.as_deref() {
        let proxy = ProxyConfig::from_url(proxy_url)?;
        info!(
            proxy_url = %proxy.url,
            proxy_type = ?proxy.proxy_type,
            has_auth = proxy.auth.is_some(),
            "Using explicit proxy configuration"
        );
        network_config.with_proxy(proxy)
    } else {
        network_config.with_system_proxy(args.use_system_proxy)
    };

    let network = Arc::new(ReqwestNetworkLayer::new(&network_config.build())?);

    let mut cache_config = CacheConfig::builder().with_mode(args.mode.into());
    cache_config = match args.cache_dir.as_ref() {
        Some(dir) => {
            info!(path = %dir.display(), "Using disk cache");
            cache_config.with_disk_backend(dir)
        }
        None => {
            info!(max_entries = args.max_entries, "Using memory cache");
            cache_config.with_memory_backend(args.max_entries)
        }
    };
    let cache = HttpCache::new(cache_config.build(), network);

    let extra_headers = headers::parse_headers(&args.headers);
    let range = args.range.as_deref().map(|range| format!("bytes={range}"));

    for url in &args.urls {
        let url = Url::parse(url)?;
        for attempt in 1..=args.repeat {
            let mut flags = LoadFlags::empty();
            if args.only_from_cache {
                flags |= LoadFlags::ONLY_FROM_CACHE;
            }
            if args.bypass && attempt == 1 {
                flags |= LoadFlags::BYPASS_CACHE;
            }

            let mut request = HttpRequest::get(url.clone()).with_load_flags(flags);
            request.headers = extra_headers.clone();
            if let Some(range) = range.as_deref() {
                request = request.with_header("range", range);
            }

            let output = (attempt == args.repeat)
                .then_some(args.output.as_deref())
                .flatten();
            fetch(&cache, request, attempt, output).await?;
        }
    }

    Ok(())
}

/// Runs one request through the cache and reports where the response came from.
async fn fetch(
    cache: &HttpCache,
    request: HttpRequest,
    attempt: u32,
    output: Option<&Path>,
) -> Result<(), AppError> {
    let url = request.url.clone();
    let started = Instant::now();

    let mut transaction = cache.create_transaction(RequestPriority::Medium);
    transaction.start(request).await?;

    let (status, was_cached, network_accessed, stale) = transaction
        .get_response_info()
        .map(|info| {
            (
                info.headers.response_code(),
                info.was_cached,
                info.network_accessed,
                info.server_data_unavailable,
            )
        })
        .ok_or_else(|| AppError::InvalidInput(format!("no response for {url}")))?;
    let mode = transaction.mode();

    let mut file = match output {
        Some(path) => Some(tokio::fs::File::create(path).await?),
        None => None,
    };

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut body_len = 0u64;
    loop {
        let n = transaction.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        body_len += n as u64;
        if let Some(file) = file.as_mut() {
            file.write_all(&buf[..n]).await?;
        }
    }
    if let Some(mut file) = file {
        file.flush().await?;
    }

    info!(
        url = %url,
        attempt,
        status,
        mode = %mode,
        was_cached,
        network_accessed,
        stale,
        body_bytes = body_len,
        network_bytes = transaction.total_received_bytes(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Fetch complete"
    );
    Ok(())
}

