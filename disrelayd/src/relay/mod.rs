pub mod client;
pub mod server;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::time::Duration;
    use shared::types::RelayStatus;
    use crate::error::RelayError;
    use crate::mdns::advertise::{Advertise, Registration};
    use crate::state::StateHandle;

    /// Records advertise/withdraw calls instead of touching the network
    #[derive(Default)]
    pub struct RecordingAdvertiser {
        advertised: Mutex<Vec<u16>>,
        withdrawn: Mutex<usize>,
    }

    impl RecordingAdvertiser {
        pub fn advertised(&self) -> Vec<u16> {
            self.advertised.lock().unwrap().clone()
        }

        pub fn withdrawn(&self) -> usize {
            *self.withdrawn.lock().unwrap()
        }
    }

    impl Advertise for RecordingAdvertiser {
        fn advertise(&self, port: u16, name: &str) -> Result<Registration, RelayError> {
            self.advertised.lock().unwrap().push(port);
            Ok(Registration {
                instance_name: name.to_string(),
                fullname: format!("{}._dis._tcp.local.", name),
            })
        }

        fn withdraw(&self, registration: Option<&Registration>) {
            if registration.is_some() {
                *self.withdrawn.lock().unwrap() += 1;
            }
        }
    }

    /// The first advertise takes a while. Tracks which full names are on the
    /// network; advertising a name twice still leaves one record.
    #[derive(Default)]
    pub struct SlowFirstAdvertiser {
        calls: Mutex<usize>,
        live: Mutex<Vec<String>>,
    }

    impl SlowFirstAdvertiser {
        pub fn live(&self) -> Vec<String> {
            self.live.lock().unwrap().clone()
        }
    }

    impl Advertise for SlowFirstAdvertiser {
        fn advertise(&self, _port: u16, name: &str) -> Result<Registration, RelayError> {
            let first = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls == 1
            };
            if first {
                std::thread::sleep(Duration::from_millis(300));
            }

            let fullname = format!("{}._dis._tcp.local.", name);
            let mut live = self.live.lock().unwrap();
            if !live.contains(&fullname) {
                live.push(fullname.clone());
            }
            Ok(Registration {
                instance_name: name.to_string(),
                fullname,
            })
        }

        fn withdraw(&self, registration: Option<&Registration>) {
            if let Some(registration) = registration {
                self.live.lock().unwrap().retain(|name| *name != registration.fullname);
            }
        }
    }

    pub struct FailingAdvertiser;

    impl Advertise for FailingAdvertiser {
        fn advertise(&self, _port: u16, _name: &str) -> Result<Registration, RelayError> {
            Err(RelayError::RegistrationFailed("name collision".to_string()))
        }

        fn withdraw(&self, _registration: Option<&Registration>) {}
    }

    /// Poll the state thread until the relay status satisfies `predicate`
    pub async fn wait_for_status(
        state: &StateHandle,
        predicate: impl Fn(&RelayStatus) -> bool,
    ) -> RelayStatus {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = state.status().await.unwrap();
                if predicate(&status) {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay status never reached the expected value")
    }
}
