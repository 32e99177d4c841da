//! Request object model tests: owned storage, method/path queries, and
//! index-based header manipulation.

use bytes::Bytes;
use hconn::{Header, HttpError, Request};

#[test]
fn request_sanity_check() {
    let request = Request::new();
    assert_eq!(request.header_count(), 0);
    assert!(request.body().is_empty());
}

#[test]
fn request_path() {
    let mut request = Request::new();

    // Queries fail when there's no data.
    assert_eq!(request.path().unwrap_err(), HttpError::DataNotAvailable);

    // Simple set/get.
    let mut path_src = b"/".to_vec();
    request.set_path(&path_src);
    assert_eq!(request.path().unwrap().as_ref(), b"/");

    // Mutilate the original buffer to be sure the request isn't
    // referencing its memory.
    path_src[0] = b'z';
    assert_eq!(request.path().unwrap().as_ref(), b"/");

    // Set a new path.
    request.set_path("/index.html");
    assert_eq!(request.path().unwrap().as_ref(), b"/index.html");
}

#[test]
fn request_method() {
    let mut request = Request::new();

    assert_eq!(request.method().unwrap_err(), HttpError::DataNotAvailable);

    let mut method_src = b"GET".to_vec();
    request.set_method(&method_src);
    assert_eq!(request.method().unwrap().as_ref(), b"GET");

    method_src[0] = b'B';
    assert_eq!(request.method().unwrap().as_ref(), b"GET");

    request.set_method("POST");
    assert_eq!(request.method().unwrap().as_ref(), b"POST");
}

#[test]
fn request_add_headers() {
    let mut request = Request::new();

    // Queries on 0 headers.
    assert_eq!(request.header(0).unwrap_err(), HttpError::InvalidIndex);
    assert_eq!(request.header_count(), 0);

    let mut name_src = b"Host".to_vec();
    let mut value_src = b"example.com".to_vec();
    request.add_header(Header::new(&name_src, &value_src));
    assert_eq!(request.header_count(), 1);

    // Mutilate the source buffers; the header must be unaffected.
    name_src[0] = 0;
    value_src[0] = 0;

    let header = request.header(0).unwrap();
    assert_eq!(header.name.as_ref(), b"Host");
    assert_eq!(header.value.as_ref(), b"example.com");
}

#[test]
fn request_erase_headers() {
    let mut request = Request::new();

    // Erasing non-existent headers has no effect.
    assert_eq!(request.erase_header(0).unwrap_err(), HttpError::InvalidIndex);

    let src_headers = [
        Header::new("NameA", "ValueA"),
        Header::new("NameB", "ValueB"),
        Header::new("NameC", "ValueC"),
        Header::new("NameD", "ValueD"),
    ];
    for header in &src_headers {
        request.add_header(header.clone());
    }
    for (i, expected) in src_headers.iter().enumerate() {
        assert_eq!(request.header(i).unwrap(), expected);
    }

    // Remove a middle one and check that the rest shifted over.
    let kill_i = 1;
    request.erase_header(kill_i).unwrap();
    assert_eq!(request.header_count(), src_headers.len() - 1);
    for i in 0..request.header_count() {
        let compare_i = if i < kill_i { i } else { i + 1 };
        assert_eq!(request.header(i).unwrap(), &src_headers[compare_i]);
    }

    // Removing an invalid index has no effect.
    assert_eq!(request.erase_header(99).unwrap_err(), HttpError::InvalidIndex);

    // Remove a front and a back header; only NameC remains.
    request.erase_header(0).unwrap();
    request.erase_header(request.header_count() - 1).unwrap();
    assert_eq!(request.header_count(), 1);
    assert_eq!(request.header(0).unwrap().name.as_ref(), b"NameC");

    // add() still works after remove().
    request.add_header(Header::new("Big", "Guy"));
    let last = request.header(request.header_count() - 1).unwrap();
    assert_eq!(last.name.as_ref(), b"Big");
    assert_eq!(last.value.as_ref(), b"Guy");
}

#[test]
fn request_body_round_trip() {
    let mut request = Request::new();
    request.set_body(Bytes::from_static(b"payload"));
    assert_eq!(request.body().as_ref(), b"payload");
}
