use fiber_context::{prepare, release, swap, thread_cache_stats, Fiber};
use std::cell::Cell;

struct Game {
    main: Fiber,
    ping: Fiber,
    pong: Fiber,
    volleys: Cell<u32>,
}

extern "C" fn ping(arg: usize) {
    let game = unsafe { &*(arg as *const Game) };
    loop {
        println!("ping {}", game.volleys.get());
        unsafe { swap(&game.pong, &game.ping) };
    }
}

extern "C" fn pong(arg: usize) {
    let game = unsafe { &*(arg as *const Game) };
    loop {
        println!("pong {}", game.volleys.get());
        game.volleys.set(game.volleys.get() + 1);
        unsafe { swap(&game.main, &game.pong) };
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    for round in 0..3 {
        let game = Box::into_raw(Box::new(Game {
            main: Fiber::new(),
            ping: Fiber::new(),
            pong: Fiber::new(),
            volleys: Cell::new(0),
        }));
        unsafe {
            prepare(&mut (*game).ping, ping, game as usize);
            prepare(&mut (*game).pong, pong, game as usize);

            // Each volley runs ping, then pong, then comes back here.
            while (*game).volleys.get() < 3 {
                swap(&(*game).ping, &(*game).main);
            }
            println!("round {} done after {} volleys", round, (*game).volleys.get());

            release(&mut (*game).ping);
            release(&mut (*game).pong);
            drop(Box::from_raw(game));
        }
    }

    println!("{:?}", thread_cache_stats());
}
