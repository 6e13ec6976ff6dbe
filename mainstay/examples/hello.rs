use std::time::Duration;

use mainstay::{timeout_source_new, Dispatch, MainContext, MainLoop, Task};

fn main() {
    #[cfg(feature = "tracing")]
    simple_logger::init().unwrap();

    let ctx = MainContext::new();
    ctx.push_thread_default();
    let main_loop = MainLoop::new(&ctx);

    let ticker = timeout_source_new(Duration::from_secs(1));
    let mut ticks = 0;
    ticker.set_callback(move || {
        ticks += 1;
        println!("tick {}", ticks);
        if ticks < 5 {
            Dispatch::Continue
        } else {
            Dispatch::Remove
        }
    });
    ticker.attach(&ctx).unwrap();

    let stopper = main_loop.clone();
    let task: Task<String> = Task::new(None, move |t| {
        println!("{}", t.propagate().unwrap());
        stopper.quit();
    });
    task.run_in_thread(|t| {
        std::thread::sleep(Duration::from_secs(6));
        t.return_value("worked off the main thread".to_string());
    });

    main_loop.run();
    ctx.pop_thread_default();
}
