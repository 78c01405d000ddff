use std::collections::VecDeque;

use submerge_lang::{Path, QueryFilter, Tsd};
use submerge_net::{
    promise, ActionMsg, AuthData, ConnError, Connection, ListenResult, Promise,
};

#[derive(Clone, Debug, PartialEq)]
pub struct PutCall {
    pub path: Path,
    pub data: Tsd,
    pub expected_hash: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergeCall {
    pub path: Path,
    pub data: Tsd,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ListenCall {
    pub path: Path,
    pub query: Option<QueryFilter>,
    pub tag: Option<i64>,
}

/// A scriptable, in-process stand-in for a real `Connection` (spec.md §6/§8):
/// every outbound call is recorded for the test to inspect, and completes
/// immediately against a queued scripted response (FIFO per call kind) —
/// defaulting to success if nothing was scripted. Server-initiated traffic
/// (pushes, connectivity changes) is injected with `push_message`/
/// `push_connectivity` and drained by the core's normal `poll_*` calls.
#[derive(Default)]
pub struct FakeConnection {
    pub puts: Vec<PutCall>,
    pub merges: Vec<MergeCall>,
    pub listens: Vec<ListenCall>,
    put_responses: VecDeque<Result<(), ConnError>>,
    merge_responses: VecDeque<Result<(), ConnError>>,
    listen_responses: VecDeque<Result<ListenResult, ConnError>>,
    incoming: VecDeque<ActionMsg>,
    connectivity: VecDeque<bool>,
    server_time_millis: i64,
}

impl FakeConnection {
    pub fn new() -> FakeConnection {
        FakeConnection::default()
    }

    pub fn script_put_response(&mut self, response: Result<(), ConnError>) {
        self.put_responses.push_back(response);
    }

    pub fn script_listen_response(&mut self, response: Result<ListenResult, ConnError>) {
        self.listen_responses.push_back(response);
    }

    pub fn push_message(&mut self, msg: ActionMsg) {
        self.incoming.push_back(msg);
    }

    pub fn push_connectivity(&mut self, connected: bool) {
        self.connectivity.push_back(connected);
    }

    pub fn set_server_time_millis(&mut self, millis: i64) {
        self.server_time_millis = millis;
    }
}

impl Connection for FakeConnection {
    fn auth(&mut self, _token: String) -> Promise<Result<AuthData, ConnError>> {
        let (p, c) = promise();
        c.complete(Ok(AuthData::default()));
        p
    }

    fn unauth(&mut self) -> Promise<Result<(), ConnError>> {
        let (p, c) = promise();
        c.complete(Ok(()));
        p
    }

    fn put(
        &mut self,
        path: Path,
        data: Tsd,
        expected_hash: Option<String>,
    ) -> Promise<Result<(), ConnError>> {
        self.puts.push(PutCall { path, data, expected_hash });
        let response = self.put_responses.pop_front().unwrap_or(Ok(()));
        let (p, c) = promise();
        c.complete(response);
        p
    }

    fn merge(&mut self, path: Path, data: Tsd) -> Promise<Result<(), ConnError>> {
        self.merges.push(MergeCall { path, data });
        let response = self.merge_responses.pop_front().unwrap_or(Ok(()));
        let (p, c) = promise();
        c.complete(response);
        p
    }

    fn listen(
        &mut self,
        path: Path,
        query: Option<QueryFilter>,
        tag: Option<i64>,
    ) -> Promise<Result<ListenResult, ConnError>> {
        self.listens.push(ListenCall { path, query, tag });
        let response = self.listen_responses.pop_front().unwrap_or_else(|| Ok(ListenResult::default()));
        let (p, c) = promise();
        c.complete(response);
        p
    }

    fn unlisten(&mut self, _path: Path, _query: Option<QueryFilter>, _tag: Option<i64>) {}

    fn on_disconnect_put(&mut self, _path: Path, _data: Tsd) -> Promise<Result<(), ConnError>> {
        let (p, c) = promise();
        c.complete(Ok(()));
        p
    }

    fn on_disconnect_merge(&mut self, _path: Path, _data: Tsd) -> Promise<Result<(), ConnError>> {
        let (p, c) = promise();
        c.complete(Ok(()));
        p
    }

    fn on_disconnect_cancel(&mut self, _path: Path) -> Promise<Result<(), ConnError>> {
        let (p, c) = promise();
        c.complete(Ok(()));
        p
    }

    fn server_time_millis(&self) -> i64 {
        self.server_time_millis
    }

    fn poll_message(&mut self) -> Option<ActionMsg> {
        self.incoming.pop_front()
    }

    fn poll_connected_change(&mut self) -> Option<bool> {
        self.connectivity.pop_front()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use submerge_lang::Scalar;

    fn leaf(n: f64) -> Tsd {
        Tsd::leaf(Scalar::Num(ordered_float::OrderedFloat(n)))
    }

    #[test]
    fn put_records_the_call_and_completes_with_the_scripted_response() {
        let mut conn = FakeConnection::new();
        conn.script_put_response(Err(ConnError::Server(submerge_net::ServerError::new("datastale"))));

        let path = Path::from_wire("/a").unwrap();
        let result = std::rc::Rc::new(std::cell::RefCell::new(None));
        let result2 = result.clone();
        conn.put(path.clone(), leaf(1.0), Some("abc".into())).on_complete(move |r| {
            *result2.borrow_mut() = Some(r);
        });

        assert_eq!(conn.puts.len(), 1);
        assert_eq!(conn.puts[0].path, path);
        assert!(matches!(result.borrow().as_ref(), Some(Err(ConnError::Server(_)))));
    }

    #[test]
    fn unscripted_put_defaults_to_success() {
        let mut conn = FakeConnection::new();
        let result = std::rc::Rc::new(std::cell::RefCell::new(None));
        let result2 = result.clone();
        conn.put(Path::from_wire("/a").unwrap(), leaf(1.0), None)
            .on_complete(move |r| *result2.borrow_mut() = Some(r));
        assert_eq!(*result.borrow(), Some(Ok(())));
    }

    #[test]
    fn pushed_messages_drain_in_fifo_order() {
        let mut conn = FakeConnection::new();
        let path = Path::from_wire("/a").unwrap();
        conn.push_message(ActionMsg::ActionSet { path: path.clone(), tag: None, data: leaf(1.0) });
        conn.push_message(ActionMsg::ActionSet { path, tag: None, data: leaf(2.0) });
        let first = conn.poll_message().unwrap();
        assert!(matches!(first, ActionMsg::ActionSet { data, .. } if data == leaf(1.0)));
        assert!(conn.poll_message().is_some());
        assert!(conn.poll_message().is_none());
    }
}
