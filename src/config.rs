//! Runtime configuration.

use crate::fiber::DEFAULT_STACK_SIZE;

/// Builder for an [`crate::IoManager`].
///
/// ```
/// let mut config = fibrio::Config::new();
/// config.set_threads(4).set_name("workers").set_use_caller(false);
/// ```
pub struct Config {
    name: String,
    threads: usize,
    use_caller: bool,
    stack_size: usize,
    hook_enabled: bool,
}

impl Config {
    pub fn new() -> Config {
        Config {
            name: String::from("fibrio"),
            threads: num_cpus::get(),
            use_caller: true,
            stack_size: DEFAULT_STACK_SIZE,
            hook_enabled: true,
        }
    }

    /// Number of worker threads. Defaults to the CPU count.
    pub fn set_threads(&mut self, threads: usize) -> &mut Self {
        self.threads = threads;
        self
    }

    /// Whether the constructing thread donates itself as a worker.
    /// Defaults to true.
    pub fn set_use_caller(&mut self, use_caller: bool) -> &mut Self {
        self.use_caller = use_caller;
        self
    }

    /// Base name for worker threads and log lines.
    pub fn set_name(&mut self, name: &str) -> &mut Self {
        self.name = name.to_string();
        self
    }

    /// Fiber stack size in bytes. Defaults to 64 KiB; values far below that
    /// risk overflow in non-trivial fiber bodies.
    pub fn set_stack_size(&mut self, stack_size: usize) -> &mut Self {
        self.stack_size = stack_size;
        self
    }

    /// Whether worker threads take the coroutine path in the hooked syscall
    /// layer. Defaults to true; disable to run the scheduler with plain
    /// blocking I/O semantics.
    pub fn set_hook_enabled(&mut self, hook_enabled: bool) -> &mut Self {
        self.hook_enabled = hook_enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn use_caller(&self) -> bool {
        self.use_caller
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn hook_enabled(&self) -> bool {
        self.hook_enabled
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
