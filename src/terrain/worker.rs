//! Background execution of per-tile numeric jobs.
//!
//! A [`WorkerDispatch`] either runs a job inline or ships it to a dedicated
//! thread. Results come back tagged with the job id and are matched against
//! the token recorded at dispatch time.
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use glam::Vec3;
use std::collections::HashMap;
use std::thread;
use tracing::{debug, info, warn};

use super::error::{Error, Result};
use super::geometry::{tangent_space, TangentSpace};

#[derive(Debug, Clone)]
pub enum Job {
    HeightfieldTangentSpace {
        positions: Vec<Vec3>,
        width: u32,
        height: u32,
    },
}

#[derive(Debug, Clone)]
pub enum JobOutput {
    TangentSpace(TangentSpace),
}

impl Job {
    pub fn run(self) -> JobOutput {
        match self {
            Job::HeightfieldTangentSpace {
                positions,
                width,
                height,
            } => JobOutput::TangentSpace(tangent_space(positions, width, height)),
        }
    }
}

#[derive(Debug)]
pub struct WorkerRequest {
    pub job_id: u64,
    pub job: Job,
}

#[derive(Debug)]
pub struct WorkerResponse {
    pub job_id: u64,
    pub result: JobOutput,
}

pub enum Dispatched<T> {
    Completed(T, JobOutput),
    Queued(u64),
}

struct WorkerChannels {
    requests: Sender<WorkerRequest>,
    responses: Receiver<WorkerResponse>,
}

fn spawn_worker() -> Result<WorkerChannels> {
    let (tx_req, rx_req) = unbounded::<WorkerRequest>();
    let (tx_res, rx_res) = unbounded::<WorkerResponse>();

    thread::Builder::new()
        .name("terrain-worker".to_string())
        .spawn(move || {
            while let Ok(WorkerRequest { job_id, job }) = rx_req.recv() {
                let result = job.run();
                if tx_res.send(WorkerResponse { job_id, result }).is_err() {
                    break;
                }
            }
            debug!("terrain worker exiting");
        })?;

    Ok(WorkerChannels {
        requests: tx_req,
        responses: rx_res,
    })
}

pub struct WorkerDispatch<T> {
    worker: Option<WorkerChannels>,
    pending: HashMap<u64, T>,
    next_job_id: u64,
}

impl<T> Default for WorkerDispatch<T> {
    fn default() -> Self {
        Self {
            worker: None,
            pending: HashMap::new(),
            next_job_id: 0,
        }
    }
}

impl<T> WorkerDispatch<T> {
    /// Dispatcher that runs every job inline until [`start`](Self::start)
    /// is called.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.worker = Some(spawn_worker()?);
        info!("terrain worker started");
        Ok(())
    }

    /// Closes the channels. Jobs in flight are forgotten, the thread exits
    /// once it notices the closed request queue.
    pub fn stop(&mut self) {
        if self.worker.take().is_some() {
            info!("terrain worker stopped, dropping {} pending jobs", self.pending.len());
        }
        self.pending.clear();
    }

    pub fn dispatch(&mut self, job: Job, token: T) -> Dispatched<T> {
        let Some(worker) = &self.worker else {
            return Dispatched::Completed(token, job.run());
        };

        let job_id = self.next_job_id;
        self.next_job_id += 1;

        match worker.requests.send(WorkerRequest { job_id, job }) {
            Ok(()) => {
                self.pending.insert(job_id, token);
                Dispatched::Queued(job_id)
            }
            Err(err) => {
                warn!("terrain worker is gone, running job {} inline", job_id);
                self.stop();
                Dispatched::Completed(token, err.into_inner().job.run())
            }
        }
    }

    /// Drains finished jobs. A response without a matching dispatch means
    /// the bookkeeping is broken and is reported as an error.
    pub fn poll(&mut self) -> Result<Vec<(T, JobOutput)>> {
        let mut done = Vec::new();
        let Some(worker) = &self.worker else {
            return Ok(done);
        };

        loop {
            match worker.responses.try_recv() {
                Ok(WorkerResponse { job_id, result }) => {
                    let token = self.pending.remove(&job_id).ok_or_else(|| {
                        Error::consistency(format!("job {job_id} not in waitlist"))
                    })?;
                    done.push((token, result));
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("terrain worker disconnected");
                    self.stop();
                    break;
                }
            }
        }
        Ok(done)
    }

    /// Blocks until every queued job has reported back.
    pub fn wait_idle(&mut self) -> Result<Vec<(T, JobOutput)>> {
        let mut done = Vec::new();
        while !self.pending.is_empty() {
            let Some(worker) = &self.worker else { break };
            match worker.responses.recv() {
                Ok(WorkerResponse { job_id, result }) => {
                    let token = self.pending.remove(&job_id).ok_or_else(|| {
                        Error::consistency(format!("job {job_id} not in waitlist"))
                    })?;
                    done.push((token, result));
                }
                Err(_) => {
                    self.stop();
                    break;
                }
            }
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_job() -> Job {
        Job::HeightfieldTangentSpace {
            positions: (0..4)
                .map(|i| Vec3::new((i % 2) as f32, 0.0, (i / 2) as f32))
                .collect(),
            width: 2,
            height: 2,
        }
    }

    #[test]
    fn inline_dispatch_completes_immediately() {
        let mut dispatch = WorkerDispatch::new();
        match dispatch.dispatch(flat_job(), "tile") {
            Dispatched::Completed(token, JobOutput::TangentSpace(space)) => {
                assert_eq!(token, "tile");
                assert_eq!(space.normals.len(), 4);
            }
            Dispatched::Queued(_) => panic!("no worker is running"),
        }
        assert!(dispatch.poll().unwrap().is_empty());
    }

    #[test]
    fn threaded_dispatch_correlates_by_id() {
        let mut dispatch = WorkerDispatch::new();
        dispatch.start().unwrap();
        dispatch.start().unwrap();

        let ids: Vec<u64> = (0..3)
            .map(|n| match dispatch.dispatch(flat_job(), n) {
                Dispatched::Queued(id) => id,
                Dispatched::Completed(..) => panic!("worker is running"),
            })
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(dispatch.pending(), 3);

        let mut tokens: Vec<i32> = dispatch
            .wait_idle()
            .unwrap()
            .into_iter()
            .map(|(token, _)| token)
            .collect();
        tokens.sort();
        assert_eq!(tokens, vec![0, 1, 2]);
        assert_eq!(dispatch.pending(), 0);
    }

    #[test]
    fn stop_forgets_pending_jobs() {
        let mut dispatch = WorkerDispatch::new();
        dispatch.start().unwrap();
        let _ = dispatch.dispatch(flat_job(), ());
        dispatch.stop();
        assert!(!dispatch.is_running());
        assert_eq!(dispatch.pending(), 0);
        assert!(matches!(dispatch.dispatch(flat_job(), ()), Dispatched::Completed(..)));
    }

    #[test]
    fn unmatched_response_is_a_consistency_error() {
        let mut dispatch: WorkerDispatch<u32> = WorkerDispatch::new();
        dispatch.start().unwrap();
        let _ = dispatch.dispatch(flat_job(), 7);
        // Forget the token so the response has nobody to go to.
        dispatch.pending.clear();

        let mut result = Ok(Vec::new());
        for _ in 0..200 {
            result = dispatch.poll();
            if result.is_err() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(matches!(result, Err(Error::Consistency(_))));
    }
}
