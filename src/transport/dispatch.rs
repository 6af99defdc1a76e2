//! Seam between connections and whatever drives them.
//!
//! A [`Connection`] never touches a socket or a thread pool directly. It
//! asks its [`Dispatcher`] to run read or write processing on a worker, to
//! arm write or read readiness on the socket, or to drop the socket. The
//! event pumper implements this over mio and two worker pools; tests drive
//! connections in memory with a manual dispatcher.

use std::sync::Arc;

use super::connection::Connection;

/// Work and readiness requests from a connection.
pub trait Dispatcher: Send + Sync {
    /// Run [`Connection::process_read`] on a reader worker.
    fn schedule_read(&self, con: &Arc<Connection>);

    /// Run [`Connection::prepare_next_write`] on a writer worker.
    fn schedule_write(&self, con: &Arc<Connection>);

    /// Bytes are waiting in the connection's write queue.
    fn wants_write(&self, con: &Arc<Connection>);

    /// Deferred reads were granted; resume reading from the socket.
    fn wants_read(&self, con: &Arc<Connection>);

    /// The connection closed. `final_bytes` are written best effort before
    /// the socket is dropped.
    fn deregister(&self, con: &Arc<Connection>, final_bytes: Option<Vec<u8>>);
}

#[cfg(test)]
pub(crate) mod manual {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::Dispatcher;
    use crate::transport::connection::Connection;

    enum Task {
        Read(Arc<Connection>),
        Write(Arc<Connection>),
    }

    /// Queues worker tasks until [`ManualDispatcher::run`] is called.
    #[derive(Default)]
    pub(crate) struct ManualDispatcher {
        tasks: Mutex<VecDeque<Task>>,
        pub deregistered: Mutex<Vec<(u64, Option<Vec<u8>>)>>,
        pub write_wakeups: Mutex<u32>,
        pub read_wakeups: Mutex<u32>,
    }

    impl ManualDispatcher {
        /// Run queued tasks, including any they schedule, until idle.
        pub(crate) fn run(&self) {
            loop {
                let Some(task) = self.tasks.lock().pop_front() else {
                    return;
                };
                match task {
                    Task::Read(con) => con.process_read(),
                    Task::Write(con) => con.prepare_next_write(),
                }
            }
        }

        pub(crate) fn pending(&self) -> usize {
            self.tasks.lock().len()
        }
    }

    impl Dispatcher for ManualDispatcher {
        fn schedule_read(&self, con: &Arc<Connection>) {
            self.tasks.lock().push_back(Task::Read(con.clone()));
        }

        fn schedule_write(&self, con: &Arc<Connection>) {
            self.tasks.lock().push_back(Task::Write(con.clone()));
        }

        fn wants_write(&self, _con: &Arc<Connection>) {
            *self.write_wakeups.lock() += 1;
        }

        fn wants_read(&self, _con: &Arc<Connection>) {
            *self.read_wakeups.lock() += 1;
        }

        fn deregister(&self, con: &Arc<Connection>, final_bytes: Option<Vec<u8>>) {
            self.deregistered.lock().push((con.id(), final_bytes));
        }
    }
}
