use std::sync::Arc;

use crossbeam_utils::thread;

use weft_kernel::{
    BarrierController, Channel, ChoiceController, Director, Process, RendezvousError, TokenKind,
    TxChannel,
};

type ProcessBody = Box<dyn FnOnce(&Process) -> Result<(), RendezvousError> + Send>;

/// How a model run ended.
#[derive(Debug)]
pub struct RunOutcome {
    /// The deadlock monitor fired: every active process was blocked.
    pub deadlocked: bool,
    /// Processes whose bodies ran to completion.
    pub finished: usize,
    /// Processes unwound by a termination or error.
    pub terminated: usize,
}

impl RunOutcome {
    pub fn all_finished(&self) -> bool {
        self.terminated == 0 && !self.deadlocked
    }
}

/// A model: one director plus the processes that will communicate
/// through it.
///
/// Channels and controllers are created from the model before the run;
/// process bodies are added with [`Model::add_process`] and all started
/// together by [`Model::run`]. A model can be rerun: the director is
/// reset and fresh bodies added.
pub struct Model {
    director: Arc<Director>,
    bodies: Vec<(String, ProcessBody)>,
}

impl Model {
    pub fn new() -> Self {
        Model {
            director: Director::new(),
            bodies: Vec::new(),
        }
    }

    pub fn director(&self) -> &Arc<Director> {
        &self.director
    }

    pub fn channel(&self) -> Channel {
        Channel::new(&self.director)
    }

    pub fn channel_of(&self, kind: TokenKind) -> Channel {
        Channel::with_kind(&self.director, Some(kind))
    }

    pub fn tx_channel(&self) -> TxChannel {
        TxChannel::new(&self.director)
    }

    pub fn tx_channel_of(&self, kind: TokenKind) -> TxChannel {
        TxChannel::with_kind(&self.director, Some(kind))
    }

    pub fn choice(&self) -> ChoiceController {
        ChoiceController::new(&self.director)
    }

    pub fn barrier(&self) -> BarrierController {
        BarrierController::new(&self.director)
    }

    /// Queue a process body for the next run.
    pub fn add_process<F>(&mut self, name: &str, body: F)
    where
        F: FnOnce(&Process) -> Result<(), RendezvousError> + Send + 'static,
    {
        self.bodies.push((name.to_string(), Box::new(body)));
    }

    /// Start every queued process, wait for all of them, and report how
    /// the run ended.
    ///
    /// Every process is registered before any thread starts, so the
    /// deadlock counters never see a half-started model.
    pub fn run(&mut self) -> RunOutcome {
        let bodies = std::mem::take(&mut self.bodies);
        let director = self.director.clone();

        let mut started: Vec<(Process, ProcessBody)> = Vec::with_capacity(bodies.len());
        for (name, body) in bodies {
            started.push((director.process_started(&name), body));
        }

        let results: Vec<bool> = thread::scope(|scope| {
            let handles: Vec<_> = started
                .into_iter()
                .map(|(process, body)| {
                    let director = &director;
                    scope.spawn(move |_| {
                        let result = body(&process);
                        if let Err(err) = &result {
                            log::debug!("process {} unwound: {}", process.name(), err);
                        }
                        let finished = result.is_ok();
                        director.process_stopped(process);
                        finished
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("process body panicked"))
                .collect()
        })
        .expect("model thread panicked");

        let finished = results.iter().filter(|ok| **ok).count();
        let outcome = RunOutcome {
            deadlocked: director.deadlock_detected(),
            finished,
            terminated: results.len() - finished,
        };
        log::info!(
            "model run ended: {} finished, {} terminated, deadlocked={}",
            outcome.finished,
            outcome.terminated,
            outcome.deadlocked
        );
        outcome
    }

    /// Clear run state so the same channels and controllers can be used
    /// again.
    pub fn reset(&self) {
        self.director.reset();
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}
