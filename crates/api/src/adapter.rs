//! HTTP adapter: turns requests into handler calls, shapes the results and streams them.
//!
//! Per request: parse path variables and query, dispatch on method and available handler,
//! call the handler, filter (list only), project, set the `next` link (list only), send.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::Path;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, MethodRouter};
use metrics::{counter, histogram};
use o2ims_core::stream::{map, select};
use o2ims_core::{BoxStream, CancellationToken, O2Error, O2Result, Object, Stream as _};
use o2ims_search::{parse_paths, parse_selector, Path as FieldPath, Projector, Selector};
use tracing::{debug, error, warn};
use url::Url;

use crate::handlers::{
    AddHandler, AddRequest, DeleteHandler, DeleteRequest, GetHandler, GetRequest, ListHandler, ListRequest,
    UpdateHandler, UpdateRequest,
};
use crate::link::{render_links, replace_next};
use crate::marker::{MarkerCipher, DEFAULT_MARKER_KEY};
use crate::problem::{problem, status_of};

pub const MARKER_PARAM: &str = "nextpage_opaque_marker";
pub const FILTER_PARAM: &str = "filter";
pub const FIELDS_PARAM: &str = "fields";
pub const EXCLUDE_FIELDS_PARAM: &str = "exclude_fields";

const JSON: &str = "application/json";
const MERGE_PATCH_JSON: &str = "application/merge-patch+json";

/// Everything an adapter needs, checked by [`Adapter::new`].
#[derive(Default, Clone)]
pub struct AdapterConfig {
    /// Route parameter names in path order, e.g. `["alarmEventRecordId"]`.
    pub path_variables: Vec<String>,
    pub list: Option<Arc<dyn ListHandler>>,
    pub get: Option<Arc<dyn GetHandler>>,
    pub add: Option<Arc<dyn AddHandler>>,
    /// Serves PATCH and PUT.
    pub update: Option<Arc<dyn UpdateHandler>>,
    pub delete: Option<Arc<dyn DeleteHandler>>,
    /// Default `fields`, used when the request has none.
    pub include_fields: Vec<String>,
    /// Default `exclude_fields`, used when the request has none.
    pub exclude_fields: Vec<String>,
    /// 32 bytes; [`DEFAULT_MARKER_KEY`] when unset.
    pub marker_key: Option<Vec<u8>>,
    /// 12 bytes; random per marker when unset.
    pub marker_nonce: Option<Vec<u8>>,
    /// Scheme and host used in generated links, e.g. `https://o2ims.example.com`.
    pub external_address: Option<String>,
}

pub struct Adapter {
    /// Reversed: most specific first.
    variables: Vec<String>,
    list: Option<Arc<dyn ListHandler>>,
    get: Option<Arc<dyn GetHandler>>,
    add: Option<Arc<dyn AddHandler>>,
    update: Option<Arc<dyn UpdateHandler>>,
    delete: Option<Arc<dyn DeleteHandler>>,
    include: Vec<FieldPath>,
    exclude: Vec<FieldPath>,
    cipher: MarkerCipher,
    external: Option<Url>,
}

/// The parts of an HTTP request the adapter looks at.
pub struct AdapterRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub params: HashMap<String, String>,
    pub body: Bytes,
}

/// Decoded query string, repeated parameters kept in order.
struct Query(Vec<(String, String)>);

impl Query {
    fn parse(uri: &Uri) -> Self {
        let raw = uri.query().unwrap_or("");
        Self(url::form_urlencoded::parse(raw.as_bytes()).into_owned().collect())
    }

    fn all(&self, name: &str) -> Vec<&str> {
        self.0.iter().filter(|(k, _)| k == name).map(|(_, v)| v.as_str()).collect()
    }

    fn first(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, v)| k == name && !v.is_empty()).map(|(_, v)| v.as_str())
    }
}

fn not_allowed(method: &Method) -> Response {
    problem(StatusCode::METHOD_NOT_ALLOWED, format!("Method '{}' is not allowed", method))
}

impl Adapter {
    pub fn new(cfg: AdapterConfig) -> O2Result<Self> {
        if cfg.list.is_none() && cfg.get.is_none() && cfg.add.is_none() && cfg.update.is_none() && cfg.delete.is_none() {
            return Err(O2Error::validation("adapter needs at least one handler"));
        }
        if cfg.list.is_some() && cfg.get.is_some() && cfg.path_variables.is_empty() {
            return Err(O2Error::validation(
                "at least one path variable is required when both the list and get handlers are set",
            ));
        }
        let external = cfg
            .external_address
            .as_deref()
            .filter(|a| !a.is_empty())
            .map(|a| Url::parse(a).map_err(|e| O2Error::Validation(format!("external address '{}': {}", a, e))))
            .transpose()?;
        let key = cfg.marker_key.as_deref().unwrap_or(&DEFAULT_MARKER_KEY);
        let cipher = MarkerCipher::new(key, cfg.marker_nonce.as_deref())?;
        let mut variables = cfg.path_variables;
        variables.reverse();
        Ok(Self {
            variables,
            list: cfg.list,
            get: cfg.get,
            add: cfg.add,
            update: cfg.update,
            delete: cfg.delete,
            include: parse_paths(&cfg.include_fields)?,
            exclude: parse_paths(&cfg.exclude_fields)?,
            cipher,
            external,
        })
    }

    /// Route target serving every method on this adapter.
    pub fn method_router<S: Clone + Send + Sync + 'static>(self: &Arc<Self>) -> MethodRouter<S> {
        let me = Arc::clone(self);
        any(
            move |params: Option<Path<HashMap<String, String>>>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes| {
                let me = Arc::clone(&me);
                async move {
                    let params = params.map(|Path(p)| p).unwrap_or_default();
                    me.serve(AdapterRequest { method, uri, headers, params, body }).await
                }
            },
        )
    }

    pub async fn serve(&self, req: AdapterRequest) -> Response {
        let method = req.method.clone();
        let resp = self.dispatch(req).await;
        counter!("adapter_requests_total", 1u64, "method" => method.to_string(), "status" => resp.status().as_u16().to_string());
        resp
    }

    fn variables(&self, params: &HashMap<String, String>) -> Vec<String> {
        self.variables.iter().map(|name| params.get(name).cloned().unwrap_or_default()).collect()
    }

    async fn dispatch(&self, req: AdapterRequest) -> Response {
        let vars = self.variables(&req.params);
        let method = req.method.clone();
        match method {
            Method::GET => match (&self.list, &self.get) {
                (None, None) => not_allowed(&method),
                (Some(l), None) => self.serve_list(l.as_ref(), &req, vars).await,
                (None, Some(g)) => self.serve_get(g.as_ref(), &req, vars).await,
                (Some(l), Some(g)) => {
                    if vars.first().map_or(true, |v| v.is_empty()) {
                        let rest = vars.get(1..).map(<[String]>::to_vec).unwrap_or_default();
                        self.serve_list(l.as_ref(), &req, rest).await
                    } else {
                        self.serve_get(g.as_ref(), &req, vars).await
                    }
                }
            },
            Method::POST => match &self.add {
                Some(a) => self.serve_add(a.as_ref(), req, vars).await,
                None => not_allowed(&method),
            },
            Method::PATCH | Method::PUT => match &self.update {
                Some(u) => self.serve_update(u.as_ref(), req, vars).await,
                None => not_allowed(&method),
            },
            Method::DELETE => match &self.delete {
                Some(d) => self.serve_delete(d.as_ref(), vars).await,
                None => not_allowed(&method),
            },
            _ => not_allowed(&method),
        }
    }

    fn selector(&self, q: &Query) -> Result<Option<Selector>, Response> {
        let mut out: Option<Selector> = None;
        for v in q.all(FILTER_PARAM) {
            let sel = parse_selector(v).map_err(|e| {
                warn!(filter = %v, error = %e, "adapter: bad filter");
                problem(StatusCode::BAD_REQUEST, format!("Failed to parse 'filter' parameter '{}': {}", v, e))
            })?;
            out = Some(match out { Some(acc) => acc.and(sel), None => sel });
        }
        Ok(out)
    }

    fn projector(&self, q: &Query) -> Result<Projector, Response> {
        let pick = |param: &str, default: &Vec<FieldPath>| -> Result<Vec<FieldPath>, Response> {
            let values = q.all(param);
            if values.is_empty() { return Ok(default.clone()); }
            parse_paths(&values).map_err(|e| {
                warn!(param, values = ?values, error = %e, "adapter: bad field list");
                problem(StatusCode::BAD_REQUEST, format!("Failed to parse '{}' parameter with values {:?}: {}", param, values, e))
            })
        };
        Ok(Projector::new(pick(FIELDS_PARAM, &self.include)?, pick(EXCLUDE_FIELDS_PARAM, &self.exclude)?))
    }

    fn marker(&self, q: &Query) -> Result<Option<Vec<u8>>, Response> {
        let Some(text) = q.first(MARKER_PARAM) else { return Ok(None) };
        self.cipher.decrypt(text).map(Some).map_err(|e| {
            warn!(text, error = %e, "adapter: bad next page marker");
            problem(StatusCode::BAD_REQUEST, format!("Failed to decrypt next page marker '{}'", text))
        })
    }

    /// Link to the next page: the request URL on the external address, every query
    /// parameter but the old marker kept, the new marker appended.
    fn next_link(&self, req: &AdapterRequest, marker: &str) -> O2Result<String> {
        let base = match &self.external {
            Some(u) => u.clone(),
            None => {
                let host = req.headers.get(header::HOST).and_then(|h| h.to_str().ok()).unwrap_or("localhost");
                Url::parse(&format!("http://{}", host)).map_err(|e| O2Error::Internal(format!("request host '{}': {}", host, e)))?
            }
        };
        let mut url = base;
        url.set_path(req.uri.path());
        url.set_query(None);
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in Query::parse(&req.uri).0.iter().filter(|(k, _)| k != MARKER_PARAM) {
                pairs.append_pair(k, v);
            }
            pairs.append_pair(MARKER_PARAM, marker);
        }
        Ok(url.to_string())
    }

    async fn serve_list(&self, handler: &dyn ListHandler, req: &AdapterRequest, variables: Vec<String>) -> Response {
        let started = Instant::now();
        let q = Query::parse(&req.uri);
        let selector = match self.selector(&q) { Ok(s) => s, Err(r) => return r };
        let projector = match self.projector(&q) { Ok(p) => p, Err(r) => return r };
        let next_page_marker = match self.marker(&q) { Ok(m) => m, Err(r) => return r };

        let ctx = CancellationToken::new();
        let list_req = ListRequest { variables, selector: selector.clone(), projector: projector.clone(), next_page_marker };
        let resp = match handler.list(&ctx, list_req).await {
            Ok(r) => r,
            Err(e @ O2Error::Validation(_)) => return problem(StatusCode::BAD_REQUEST, e.to_string()),
            Err(e) => {
                error!(error = %e, "adapter: failed to get items");
                return problem(StatusCode::INTERNAL_SERVER_ERROR, "Failed to get items");
            }
        };

        let mut items = resp.items;
        if let Some(sel) = selector {
            items = select(items, move |o: &Object| sel.matches(o));
        }
        if !projector.is_identity() {
            items = map(items, move |o: Object| Ok(projector.apply(&o)));
        }

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON));
        if let Some(cursor) = resp.next_page_marker {
            let link = self.cipher.encrypt(&cursor).and_then(|m| self.next_link(req, &m));
            let link = match link {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, "adapter: failed to build next page link");
                    return problem(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encrypt next page marker");
                }
            };
            let mut links = Vec::new();
            replace_next(&mut links, link);
            match HeaderValue::from_str(&render_links(&links)) {
                Ok(v) => { headers.insert(header::LINK, v); }
                Err(e) => error!(error = %e, "adapter: link header is not a valid header value"),
            }
        }
        (StatusCode::OK, headers, Body::from_stream(json_array(items, ctx, started))).into_response()
    }

    async fn serve_get(&self, handler: &dyn GetHandler, req: &AdapterRequest, variables: Vec<String>) -> Response {
        let q = Query::parse(&req.uri);
        let projector = match self.projector(&q) { Ok(p) => p, Err(r) => return r };
        let ctx = CancellationToken::new();
        let _guard = ctx.clone().drop_guard();
        match handler.get(&ctx, GetRequest { variables, projector: projector.clone() }).await {
            Ok(r) => send_object(&projector.apply(&r.object)),
            Err(e) => {
                debug!(error = %e, "adapter: get failed");
                match status_of(&e) {
                    StatusCode::NOT_FOUND => problem(StatusCode::NOT_FOUND, "Not found"),
                    StatusCode::BAD_REQUEST => problem(StatusCode::BAD_REQUEST, e.to_string()),
                    _ => {
                        error!(error = %e, "adapter: failed to get object");
                        problem(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
                    }
                }
            }
        }
    }

    async fn serve_add(&self, handler: &dyn AddHandler, req: AdapterRequest, variables: Vec<String>) -> Response {
        let object = match json_body(&req, &[JSON]) { Ok(o) => o, Err(r) => return r };
        let ctx = CancellationToken::new();
        let _guard = ctx.clone().drop_guard();
        match handler.add(&ctx, AddRequest { variables, object }).await {
            Ok(r) => send_object(&r.object),
            Err(e @ O2Error::Validation(_)) => problem(StatusCode::BAD_REQUEST, e.to_string()),
            Err(e) => {
                error!(error = %e, "adapter: failed to add item");
                problem(StatusCode::INTERNAL_SERVER_ERROR, "Failed to add item")
            }
        }
    }

    async fn serve_update(&self, handler: &dyn UpdateHandler, req: AdapterRequest, variables: Vec<String>) -> Response {
        let replace = req.method == Method::PUT;
        let accepted: &[&str] = if replace { &[JSON] } else { &[JSON, MERGE_PATCH_JSON] };
        let object = match json_body(&req, accepted) { Ok(o) => o, Err(r) => return r };
        let ctx = CancellationToken::new();
        let _guard = ctx.clone().drop_guard();
        match handler.update(&ctx, UpdateRequest { variables, object, replace }).await {
            Ok(r) => send_object(&r.object),
            Err(e) => match status_of(&e) {
                StatusCode::INTERNAL_SERVER_ERROR => {
                    error!(error = %e, "adapter: failed to update item");
                    problem(StatusCode::INTERNAL_SERVER_ERROR, "Failed to update item")
                }
                status => {
                    debug!(error = %e, "adapter: update rejected");
                    problem(status, e.to_string())
                }
            },
        }
    }

    async fn serve_delete(&self, handler: &dyn DeleteHandler, variables: Vec<String>) -> Response {
        let ctx = CancellationToken::new();
        let _guard = ctx.clone().drop_guard();
        match handler.delete(&ctx, DeleteRequest { variables }).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(e @ O2Error::Validation(_)) => problem(StatusCode::BAD_REQUEST, e.to_string()),
            Err(e) => {
                error!(error = %e, "adapter: failed to delete item");
                problem(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete item")
            }
        }
    }
}

/// The request body as a JSON object, after checking its content type against `accepted`.
fn json_body(req: &AdapterRequest, accepted: &[&str]) -> Result<Object, Response> {
    let Some(ct) = req.headers.get(header::CONTENT_TYPE) else {
        return Err(problem(StatusCode::BAD_REQUEST, "Content type is mandatory, use 'application/json'"));
    };
    let Ok(ct) = ct.to_str() else {
        return Err(problem(StatusCode::BAD_REQUEST, "Failed to parse content type"));
    };
    let media = ct.split(';').next().unwrap_or("").trim();
    if !accepted.iter().any(|a| media.eq_ignore_ascii_case(a)) {
        return Err(problem(
            StatusCode::BAD_REQUEST,
            format!("Content type '{}' isn't supported, use '{}'", media, accepted.join("' or '")),
        ));
    }
    match serde_json::from_slice::<serde_json::Value>(&req.body) {
        Ok(serde_json::Value::Object(o)) => Ok(o),
        Ok(_) | Err(_) => Err(problem(StatusCode::BAD_REQUEST, "Failed to decode input")),
    }
}

fn send_object(object: &Object) -> Response {
    match serde_json::to_vec(object) {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, JSON)], body).into_response(),
        Err(e) => {
            error!(error = %e, "adapter: failed to encode object");
            problem(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

/// Incremental JSON array, one chunk per item. A failing source closes the array early;
/// dropping the body (client gone) cancels `ctx`.
fn json_array(
    mut items: BoxStream<Object>,
    ctx: CancellationToken,
    started: Instant,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    async_stream::stream! {
        let _guard = ctx.clone().drop_guard();
        yield Ok(Bytes::from_static(b"["));
        let mut count = 0usize;
        loop {
            match items.next(&ctx).await {
                Ok(Some(obj)) => match serde_json::to_vec(&obj) {
                    Ok(buf) => {
                        let mut chunk = Vec::with_capacity(buf.len() + 1);
                        if count > 0 { chunk.push(b','); }
                        chunk.extend_from_slice(&buf);
                        count += 1;
                        yield Ok(Bytes::from(chunk));
                    }
                    Err(e) => {
                        error!(error = %e, "adapter: failed to encode item");
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, count, "adapter: failed to get next item");
                    break;
                }
            }
        }
        yield Ok(Bytes::from_static(b"]"));
        histogram!("adapter_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(count, took_ms = %started.elapsed().as_millis(), "adapter: list sent");
    }
}
