// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::error::{status_of, Error as ApiError};
use crate::hits::Routes;
use anyhow::{anyhow, Context, Error, Result};
use enclose::enclose;
use futures::stream::{FuturesUnordered, TryStreamExt};
use futures::FutureExt;
use hyper::http::uri::PathAndQuery;
use std::convert::Infallible;
use std::future::ready;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use txscope::{JobContext, RequestMeta};

pub async fn spawn(
    routes: Arc<Routes>,
    listen_addr: String,
) -> Result<(Vec<SocketAddr>, JoinHandle<Result<()>>)> {
    let servers = FuturesUnordered::new();
    let mut local_addrs = Vec::new();
    for addr in tokio::net::lookup_host(listen_addr).await? {
        let make_service = hyper::service::make_service_fn(enclose! {(routes) move |_conn| {
            let service = hyper::service::service_fn(enclose!{(routes) move |request| {
                handle_request(routes.clone(), request).map(Ok::<_, Infallible>)
            }});
            ready(Ok::<_, Infallible>(service))
        }});

        let incoming = hyper::server::conn::AddrIncoming::bind(&addr)?;
        local_addrs.push(incoming.local_addr());
        let server = hyper::Server::builder(incoming).serve(make_service);

        servers.push(server);
    }

    let task = tokio::task::spawn(async move {
        servers
            .try_collect()
            .await
            .context("Error while serving HTTP API")
    });
    Ok((local_addrs, task))
}

async fn handle_request(
    routes: Arc<Routes>,
    request: hyper::Request<hyper::Body>,
) -> hyper::Response<hyper::Body> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let mut response = try_handle_request(routes, request)
        .await
        .unwrap_or_else(|err| handle_error(&method, &uri, err));
    add_default_headers(&mut response);
    debug!("{} {} -> {}", method, uri, response.status());
    response
}

async fn try_handle_request(
    routes: Arc<Routes>,
    request: hyper::Request<hyper::Body>,
) -> Result<hyper::Response<hyper::Body>> {
    let path = request.uri().path();
    let normalized_path = normalize_path(path);
    if normalized_path != path {
        return Ok(redirect_to_path(request.uri(), &normalized_path));
    }

    let action = match routes.find(request.method(), path) {
        Some(action) => action.clone(),
        None => return Err(ApiError::not_found(anyhow!("no route for {}", path)).into()),
    };

    // Every request gets its own context; the transaction scope binds its session there.
    let ctx = JobContext::http_request(request_meta(&request));
    let value = action.call(&ctx)?.await?;

    let body = serde_json::to_string(&value)?;
    Ok(hyper::Response::builder()
        .status(hyper::StatusCode::OK)
        .header("content-type", "application/json")
        .body(hyper::Body::from(body))
        .unwrap())
}

fn request_meta(request: &hyper::Request<hyper::Body>) -> RequestMeta {
    RequestMeta {
        method: request.method().to_string(),
        path: request.uri().path().to_owned(),
        query: request.uri().query().map(|q| q.to_owned()),
    }
}

fn handle_error(
    method: &hyper::Method,
    uri: &hyper::Uri,
    err: Error,
) -> hyper::Response<hyper::Body> {
    let status = status_of(&err);
    if status.is_server_error() {
        log::error!("Error while handling {} {}: {:?}", method, uri, err);
    } else {
        debug!("Rejected {} {}: {}", method, uri, err);
    }
    hyper::Response::builder()
        .status(status)
        .body(hyper::Body::from(format!("{}\n", err)))
        .unwrap()
}

fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len());
    normalized.push('/');
    for (i, segment) in path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .enumerate()
    {
        if i != 0 {
            normalized.push('/');
        }
        normalized.push_str(segment);
    }
    normalized
}

fn redirect_to_path(uri: &hyper::Uri, path: &str) -> hyper::Response<hyper::Body> {
    let mut parts = uri.clone().into_parts();

    let path_and_query = parts
        .path_and_query
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    let path_and_query_str = match path_and_query.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };
    parts.path_and_query = Some(PathAndQuery::from_str(&path_and_query_str).unwrap());

    let redirect_uri = hyper::Uri::from_parts(parts).unwrap();
    hyper::Response::builder()
        .status(hyper::StatusCode::PERMANENT_REDIRECT)
        .header("location", redirect_uri.to_string())
        .body(hyper::Body::empty())
        .unwrap()
}

const CORS_HEADERS: &[(&str, &str)] = &[
    ("access-control-allow-origin", "*"),
    ("access-control-allow-methods", "GET, POST"),
    ("access-control-allow-headers", "Content-Type"),
];

fn add_default_headers(response: &mut hyper::Response<hyper::Body>) {
    let headers = response.headers_mut();
    for &(name, value) in CORS_HEADERS {
        headers
            .entry(hyper::header::HeaderName::from_static(name))
            .or_insert_with(|| hyper::header::HeaderValue::from_static(value));
    }
}
