mod common;

use std::fs;

use common::{record, request};
use tether::{
    BytesSource, ErrorKind, EventLoop, KnownHeader, Manager, ReplyEvent, Request,
    RequestAttributes,
};
use url::Url;

fn file_request(path: &std::path::Path) -> Request {
    Request::new(Url::from_file_path(path).unwrap())
}

#[test]
fn test_data_url_is_served_asynchronously() {
    let ev = EventLoop::new();
    let manager = Manager::new(&ev);

    let reply = manager.get(request("data:text/plain;charset=utf-8,hello%20there"));
    assert!(!reply.is_finished());
    ev.run_until_idle();

    assert!(reply.error().is_none());
    assert_eq!(
        reply.header(KnownHeader::ContentType).as_deref(),
        Some("text/plain;charset=utf-8")
    );
    assert_eq!(reply.header(KnownHeader::ContentLength).as_deref(), Some("11"));
    assert_eq!(&reply.read_all()[..], b"hello there");
}

#[test]
fn test_data_url_synchronous() {
    let ev = EventLoop::new();
    let manager = Manager::new(&ev);
    let events = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));

    let req = request("data:;base64,aGk=")
        .with_attributes(RequestAttributes::default().synchronous(true));
    let reply = manager.get(req);

    assert!(reply.is_finished());
    assert_eq!(&reply.read_all()[..], b"hi");
    // Nothing is left for the loop.
    let sink = events.clone();
    reply.connect(move |_, e| sink.borrow_mut().push(e.clone()));
    ev.run_until_idle();
    assert!(events.borrow().is_empty());
}

#[test]
fn test_invalid_data_url() {
    let ev = EventLoop::new();
    let manager = Manager::new(&ev);

    let reply = manager.get(request("data:no-comma-here"));
    ev.run_until_idle();

    let error = reply.error().unwrap();
    assert_eq!(error.kind, ErrorKind::ProtocolInvalidOperation);
    assert_eq!(error.message, "Invalid URI: data:no-comma-here");
}

#[test]
fn test_file_get_and_head() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    fs::write(&path, b"line one\nline two\n").unwrap();

    let ev = EventLoop::new();
    let manager = Manager::new(&ev);

    let get = manager.get(file_request(&path));
    let head = manager.head(file_request(&path));
    let events = record(&get);
    ev.run_until_idle();

    assert!(get.error().is_none());
    assert_eq!(get.header(KnownHeader::ContentLength).as_deref(), Some("18"));
    assert!(get.can_read_line());
    assert_eq!(&get.read_line(100)[..], b"line one\n");
    assert_eq!(&get.read_all()[..], b"line two\n");
    assert!(events.borrow().contains(&ReplyEvent::DownloadProgress {
        received: 18,
        total: Some(18)
    }));

    assert!(head.is_finished());
    assert!(head.error().is_none());
    assert_eq!(head.header(KnownHeader::ContentLength).as_deref(), Some("18"));
    assert_eq!(head.bytes_available(), 0);
}

#[test]
fn test_missing_file_and_directory() {
    let dir = tempfile::tempdir().unwrap();
    let ev = EventLoop::new();
    let manager = Manager::new(&ev);

    let missing = manager.get(file_request(&dir.path().join("absent")));
    let directory = manager.get(file_request(dir.path()));
    ev.run_until_idle();

    assert_eq!(missing.error().unwrap().kind, ErrorKind::ContentNotFound);
    assert_eq!(
        directory.error().unwrap().kind,
        ErrorKind::ContentOperationNotPermitted
    );
}

#[test]
fn test_file_put_writes_upload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");
    fs::write(&path, b"old contents that are longer").unwrap();

    let ev = EventLoop::new();
    let manager = Manager::new(&ev);
    let reply = manager.put(file_request(&path), BytesSource::shared(&b"fresh"[..]));
    let events = record(&reply);
    ev.run_until_idle();

    assert!(reply.error().is_none());
    assert!(reply.is_finished());
    assert_eq!(fs::read(&path).unwrap(), b"fresh");
    assert!(events.borrow().contains(&ReplyEvent::UploadProgress {
        sent: 5,
        total: Some(5)
    }));
}

#[test]
fn test_registered_resource() {
    let ev = EventLoop::new();
    let manager = Manager::new(&ev);
    manager.register_resource("/icons/app.svg", &b"<svg/>"[..]);

    let found = manager.get(request("qrc:/icons/app.svg"));
    let missing = manager.get(request("qrc:/icons/none.svg"));
    ev.run_until_idle();

    assert_eq!(&found.read_all()[..], b"<svg/>");
    assert_eq!(missing.error().unwrap().kind, ErrorKind::ContentNotFound);
}

#[test]
fn test_supported_schemes_include_local_ones() {
    let ev = EventLoop::new();
    let manager = Manager::new(&ev);
    let schemes = manager.supported_schemes();
    for scheme in ["data", "file", "qrc"] {
        assert!(schemes.iter().any(|s| s == scheme), "{scheme} missing");
    }
}
