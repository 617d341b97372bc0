/* Refract Proxy (AGPL-3.0)

Copyright (C) 2026 - Refract Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

//! Pipeline-level tests driving the full translation stage chain over
//! synthetic flows, together with resolver commit semantics. These cover
//! the proxied round trip shape without sockets.

use http::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONNECTION, CONTENT_LENGTH,
    CONTENT_SECURITY_POLICY, CONTENT_TYPE, COOKIE, HOST, SET_COOKIE,
};
use http::{Method, StatusCode, Uri, Version};

use refract_proxy::proxy::flow::{BodyBuffer, Flow, RequestParts, ResponseParts};
use refract_proxy::proxy::stages::StagePipeline;
use refract_proxy::resolve::{Candidate, Origin, OriginList, OriginResolver};

const PROXY_HOST: &str = "localhost:3000";

fn pipeline() -> StagePipeline {
    StagePipeline::build(PROXY_HOST).expect("pipeline builds")
}

fn get_flow(path: &'static str) -> Flow {
    Flow::new(RequestParts {
        method: Method::GET,
        uri: Uri::from_static(path),
        version: Version::HTTP_11,
        headers: http::HeaderMap::new(),
        body: BodyBuffer::default(),
    })
}

fn html_response(body: &str) -> ResponseParts {
    let mut response = ResponseParts::default();
    response.status = StatusCode::OK;
    response.headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response.body.push_bytes(body.as_bytes());
    response
}

#[tokio::test]
async fn proxied_html_round_trip_rewrites_links_and_remembers_origin() {
    let stages = pipeline();
    let resolver = OriginResolver::new(Origin::new("https://fallback.example"));

    let mut flow = get_flow("/https.www.example.com/");
    let list = OriginList::default();
    let resolution = resolver.resolve("/https.www.example.com/", &list);
    assert_eq!(resolution.upstream_target, "/");

    stages.process_request(&mut flow).await.unwrap();

    flow.response = Some(html_response(r#"<a href="https://www.example.com/x">"#));

    stages.process_response_headers(&mut flow).await.unwrap();
    stages.process_response_body(&mut flow).await.unwrap();

    let body = flow.response.as_ref().unwrap().body.as_bytes().to_vec();
    assert_eq!(
        String::from_utf8(body).unwrap(),
        r#"<a href="http://localhost:3000/https.www.example.com/x">"#
    );

    let winner = &resolution.candidates[0];
    let mutated = resolver
        .commit(&list, winner, StatusCode::OK, &Method::GET, true)
        .expect("origin learned");
    assert_eq!(mutated.to_cookie_value(), r#"["https://www.example.com"]"#);
}

#[tokio::test]
async fn fallback_chain_promotes_the_survivor() {
    let resolver = OriginResolver::new(Origin::new("https://fallback.example"));
    let list = OriginList::from_cookie_value(r#"["https://a.example","https://b.example"]"#)
        .expect("cookie parses");

    let resolution = resolver.resolve("/", &list);
    assert_eq!(resolution.candidates.len(), 2);

    // a.example answered 503, b.example answered 200: the dispatcher would
    // pick index 1, and the commit drops the dead head.
    let winner = Candidate {
        origin: Origin::new("https://b.example"),
        list_index: Some(1),
    };
    let mutated = resolver
        .commit(&list, &winner, StatusCode::OK, &Method::GET, true)
        .expect("list emitted");
    assert_eq!(mutated.to_cookie_value(), r#"["https://b.example"]"#);
}

#[tokio::test]
async fn binary_responses_pass_byte_exact_with_their_length() {
    let stages = pipeline();
    let payload: Vec<u8> = (0u8..10).collect();

    let mut flow = get_flow("/");
    let mut response = ResponseParts::default();
    response.status = StatusCode::OK;
    response
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
    response.headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&payload.len().to_string()).unwrap(),
    );
    response.body.push_bytes(&payload);
    flow.response = Some(response);

    stages.process_response_headers(&mut flow).await.unwrap();
    stages.process_response_body(&mut flow).await.unwrap();

    let response = flow.response.as_ref().unwrap();
    assert_eq!(response.body.as_bytes(), &payload[..]);
    assert_eq!(
        response
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok()),
        Some("10")
    );
}

#[tokio::test]
async fn outbound_headers_never_leak_proxy_state() {
    let stages = pipeline();

    let mut request = RequestParts {
        method: Method::POST,
        uri: Uri::from_static("/submit"),
        version: Version::HTTP_11,
        headers: http::HeaderMap::new(),
        body: BodyBuffer::default(),
    };
    request.body.push_bytes(b"payload");
    request
        .headers
        .insert(HOST, HeaderValue::from_static(PROXY_HOST));
    request
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from_static("7"));
    request.headers.insert(
        "content-encoding",
        HeaderValue::from_static("gzip"),
    );
    request.headers.insert(
        COOKIE,
        HeaderValue::from_str(
            r#"proxyTargets=["https://a.example"]; _proxyTargets=upstream; sid=9"#,
        )
        .unwrap(),
    );
    let mut flow = Flow::new(request);

    stages.process_request(&mut flow).await.unwrap();

    let headers = &flow.request.headers;
    assert!(headers.get(CONTENT_LENGTH).is_none());
    assert!(headers.get("content-encoding").is_none());
    assert!(headers.get("transfer-encoding").is_none());

    let cookies = headers.get(COOKIE).and_then(|v| v.to_str().ok()).unwrap();
    assert_eq!(cookies, "proxyTargets=upstream; sid=9");
}

#[tokio::test]
async fn upstream_state_cookie_collisions_are_escaped() {
    let stages = pipeline();

    let mut flow = get_flow("/");
    let mut response = html_response("<p>ok</p>");
    response.headers.append(
        SET_COOKIE,
        HeaderValue::from_static("proxyTargets=theirs; Domain=.upstream.example"),
    );
    response
        .headers
        .append(SET_COOKIE, HeaderValue::from_static("sid=1; Path=/"));
    flow.response = Some(response);

    stages.process_response_headers(&mut flow).await.unwrap();

    let values: Vec<String> = flow
        .response
        .as_ref()
        .unwrap()
        .headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .collect();
    assert_eq!(
        values,
        vec![
            "_proxyTargets=theirs; Domain=localhost".to_string(),
            "sid=1; Path=/".to_string(),
        ]
    );
}

#[tokio::test]
async fn response_headers_are_relaxed_for_the_browser() {
    let stages = pipeline();

    let mut flow = get_flow("/");
    let mut response = html_response("<p>ok</p>");
    response.headers.insert(
        CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    response
        .headers
        .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    flow.response = Some(response);

    stages.process_response_headers(&mut flow).await.unwrap();

    let headers = &flow.response.as_ref().unwrap().headers;
    assert!(headers.get(CONNECTION).is_none());
    assert_eq!(
        headers
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
    let csp = headers
        .get(CONTENT_SECURITY_POLICY)
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert!(csp.contains("report-uri http://localhost:3000/debug/csp"));
}

#[tokio::test]
async fn rewriting_is_idempotent_across_pipeline_runs() {
    let stages = pipeline();
    let html = r#"<script src="https://cdn.example.com/app.js"></script>"#;

    let mut flow = get_flow("/");
    flow.response = Some(html_response(html));
    stages.process_response_body(&mut flow).await.unwrap();
    let first = flow.response.as_ref().unwrap().body.as_bytes().to_vec();

    let mut flow2 = get_flow("/");
    let mut again = ResponseParts::default();
    again.status = StatusCode::OK;
    again
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
    again.body.push_bytes(&first);
    flow2.response = Some(again);
    stages.process_response_body(&mut flow2).await.unwrap();
    let second = flow2.response.as_ref().unwrap().body.as_bytes().to_vec();

    assert_eq!(first, second);
}
