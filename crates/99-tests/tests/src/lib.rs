//! End-to-end tests for the transport stack.

#[cfg(test)]
mod support;



#[cfg(test)]
mod fifo;

#[cfg(test)]
mod roundtrip;

#[cfg(test)]
mod handoff;

#[cfg(test)]
mod scenarios;
